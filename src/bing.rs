use std::error::Error as StdError;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::Url;
use thiserror::Error;
use tokio::fs::{create_dir_all, File};
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

use crate::command::{CommandRunner, Invocation};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Market {
    #[default]
    EnglishUS,
    ChineseChina,
    JapaneseJapan,
    EnglishAustralia,
    EnglishUK,
    EnglishGB,
    GermanGermany,
    FrenchFrance,
    EnglishNewZealand,
    EnglishCanada,
    SpanishSpain,
    SpanishLatinAmerica,
    PortugueseBrazil,
    PortuguesePortugal,
    DanishDenmark,
}

impl Market {
    pub const ALL: [Market; 15] = [
        Market::EnglishUS,
        Market::ChineseChina,
        Market::JapaneseJapan,
        Market::EnglishAustralia,
        Market::EnglishUK,
        Market::EnglishGB,
        Market::GermanGermany,
        Market::FrenchFrance,
        Market::EnglishNewZealand,
        Market::EnglishCanada,
        Market::SpanishSpain,
        Market::SpanishLatinAmerica,
        Market::PortugueseBrazil,
        Market::PortuguesePortugal,
        Market::DanishDenmark,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Market::EnglishUS => "en-US",
            Market::ChineseChina => "zh-CN",
            Market::JapaneseJapan => "ja-JP",
            Market::EnglishAustralia => "en-AU",
            Market::EnglishUK => "en-UK",
            Market::EnglishGB => "en-GB",
            Market::GermanGermany => "de-DE",
            Market::FrenchFrance => "fr-FR",
            Market::EnglishNewZealand => "en-NZ",
            Market::EnglishCanada => "en-CA",
            Market::SpanishSpain => "es-ES",
            Market::SpanishLatinAmerica => "es-XL",
            Market::PortugueseBrazil => "pt-BR",
            Market::PortuguesePortugal => "pt-PT",
            Market::DanishDenmark => "da-DK",
        }
    }
}

impl Debug for Market {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl Display for Market {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
#[error("Unknown market: {0}, market must be one of the following: {list}", list = supported_markets())]
pub struct UnknownMarket(pub String);

fn supported_markets() -> String {
    Market::ALL.iter().map(Market::code).collect::<Vec<_>>().join(" ")
}

impl FromStr for Market {
    type Err = UnknownMarket;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Market::ALL
            .into_iter()
            .find(|market| market.code() == s)
            .ok_or_else(|| UnknownMarket(s.to_owned()))
    }
}

const BING_IMAGE_API_BASE_URL: &str = "https://www.bing.com/HPImageArchive.aspx";
const BING_BASE_URL: &str = "https://www.bing.com";

/// Resolution suffixes, best first. Bing does not publish every size every day.
pub const RESOLUTIONS: [&str; 7] = [
    "UHD",
    "1920x1200",
    "1920x1080",
    "1366x768",
    "1280x768",
    "1280x720",
    "1024x768",
];

/// File managers (KDE's in particular) cannot handle file names carrying this query prefix.
const QUERY_PREFIX: &str = "th?id=";

const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// `ENETUNREACH` on Linux.
const NETWORK_UNREACHABLE_OS_ERROR: i32 = 101;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network is unreachable: {0}")]
    Unreachable(#[source] Box<dyn StdError + Send + Sync>),
    #[error(transparent)]
    Request(reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if is_network_unreachable(&err) {
            FetchError::Unreachable(Box::new(err))
        } else {
            FetchError::Request(err)
        }
    }
}

/// Walks the source chain looking for the one transient condition worth retrying.
pub fn is_network_unreachable(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if io.raw_os_error() == Some(NETWORK_UNREACHABLE_OS_ERROR) {
                return true;
            }
        }
        if err.to_string().to_lowercase().contains("network is unreachable") {
            return true;
        }
        source = err.source();
    }
    false
}

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// A response whose body has not been read yet.
pub struct Fetched {
    pub status: u16,
    /// Final URL after any redirects.
    pub url: Url,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

/// HTTP transport used by [`Bing`].
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn text(&self, url: &str) -> Result<String, FetchError>;

    async fn get(&self, url: &str) -> Result<Fetched, FetchError>;
}

#[async_trait]
impl Fetch for reqwest::Client {
    async fn text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.get(url).send().await?.text().await?)
    }

    async fn get(&self, url: &str) -> Result<Fetched, FetchError> {
        let response = reqwest::Client::get(self, url).send().await?;
        Ok(Fetched {
            status: response.status().as_u16(),
            url: response.url().clone(),
            content_length: response.content_length(),
            body: Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(FetchError::from))),
        })
    }
}

/// One attempt on the resolution ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub resolution: &'static str,
    pub url: String,
    pub expected_len: Option<u64>,
}

/// A verified image on disk: its size matched the transfer header and its content sniffs as
/// an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedImage {
    pub path: PathBuf,
    pub len: u64,
    pub mime: String,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Bing metadata did not contain an image url base")]
    Metadata,
    #[error("No resolution of today's picture could be downloaded and verified")]
    NoImageAvailable,
    #[error("{0} is required to verify downloads, please install it")]
    MissingDependency(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Failed to access {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

/// Extracts the `<urlBase>` token from the archive's XML answer.
fn extract_url_base(body: &str) -> Option<String> {
    let re = Regex::new(r"<urlBase>(.*?)</urlBase>").ok()?;
    let token = re.captures(body)?.get(1)?.as_str().trim();
    (!token.is_empty()).then(|| token.to_owned())
}

/// Local file name for an image url: its last path segment without the query prefix.
pub fn local_file_name(url: &str) -> String {
    let name = url.rsplit('/').next().unwrap_or(url);
    let name = name.strip_prefix(QUERY_PREFIX).unwrap_or(name);
    name.split('&').next().unwrap_or(name).to_owned()
}

/// Bing answers unpublished resolutions by quietly serving a default image from elsewhere.
fn is_same_target(requested: &str, resolved: &Url) -> bool {
    match Url::parse(requested) {
        Ok(requested) => requested.path() == resolved.path() && requested.query() == resolved.query(),
        Err(_) => false,
    }
}

pub struct Bing {
    fetch: Arc<dyn Fetch>,
    runner: Arc<dyn CommandRunner>,
    retry_delay: Duration,
}

impl Bing {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Bing {
        Self::with_fetch(Arc::new(reqwest::Client::new()), runner)
    }

    pub fn with_fetch(fetch: Arc<dyn Fetch>, runner: Arc<dyn CommandRunner>) -> Bing {
        Bing {
            fetch,
            runner,
            retry_delay: NETWORK_RETRY_DELAY,
        }
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Bing {
        self.retry_delay = retry_delay;
        self
    }

    /// Resolves today's image url base, e.g. `https://www.bing.com/th?id=OHR.Foo_EN-US123`.
    /// Waits out an unreachable network indefinitely; any other error is returned.
    pub async fn url_base(&self, market: Market) -> Result<String, AcquireError> {
        let url = format!("{}?format=xml&idx=0&n=1&mkt={}", BING_IMAGE_API_BASE_URL, market);
        let body = loop {
            match self.fetch.text(&url).await {
                Ok(body) => break body,
                Err(FetchError::Unreachable(err)) => {
                    warn!("{}, retrying in {:?}", err, self.retry_delay);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let token = extract_url_base(&body).ok_or(AcquireError::Metadata)?;
        Ok(format!("{}{}", BING_BASE_URL, token))
    }

    /// Downloads the best published resolution of today's picture into `directory`.
    ///
    /// A file that is already present and verifies is returned as is, without reading the
    /// response body, so polling an unchanged picture writes nothing.
    pub async fn acquire(&self, market: Market, directory: &Path) -> Result<DownloadedImage, AcquireError> {
        let base = self.url_base(market).await?;

        if let Ok(false) = tokio::fs::try_exists(directory).await {
            info!("Creating {}", directory.display());
            create_dir_all(directory)
                .await
                .map_err(|err| AcquireError::Io(directory.to_owned(), err))?;
        }

        for resolution in RESOLUTIONS {
            let url = format!("{}_{}.jpg", base, resolution);
            info!("Upstream uri: {}", url);

            let response = self.fetch.get(&url).await?;
            if response.status != 200 {
                debug!("{} answered {}, trying next resolution", url, response.status);
                continue;
            }
            if !is_same_target(&url, &response.url) {
                debug!("{} was redirected to {}, trying next resolution", url, response.url);
                continue;
            }

            let candidate = ImageCandidate {
                resolution,
                url,
                expected_len: response.content_length,
            };
            let path = directory.join(local_file_name(&candidate.url));

            if let Ok(true) = tokio::fs::try_exists(&path).await {
                if let Some(image) = self.verify(&path, candidate.expected_len).await? {
                    debug!("Picture already downloaded: {}", image.path.display());
                    return Ok(image);
                }
                debug!("Discarding stale {}", path.display());
                remove(&path).await?;
            }

            self.write_body(&path, response.body).await?;
            if let Some(image) = self.verify(&path, candidate.expected_len).await? {
                info!("Downloaded to: {}", image.path.display());
                return Ok(image);
            }
            warn!("Download of the {} picture failed verification", candidate.resolution);
            remove(&path).await?;
        }

        Err(AcquireError::NoImageAvailable)
    }

    async fn write_body(&self, path: &Path, mut body: BodyStream) -> Result<(), AcquireError> {
        debug!("Writing image into {}", path.display());
        let io_err = |err| AcquireError::Io(path.to_owned(), err);

        let mut file = File::create(path).await.map_err(io_err)?;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => file.write_all(&chunk).await.map_err(io_err)?,
                Err(err) => {
                    // Truncated file is caught by verification.
                    warn!("Download of {} interrupted: {}", path.display(), err);
                    break;
                }
            }
        }
        file.flush().await.map_err(io_err)?;
        Ok(())
    }

    /// Checks size against the transfer header and sniffs the MIME type. `None` means the
    /// file is not a complete image.
    async fn verify(&self, path: &Path, expected_len: Option<u64>) -> Result<Option<DownloadedImage>, AcquireError> {
        let len = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(None),
        };
        if expected_len != Some(len) {
            debug!("{} is {} bytes, expected {:?}", path.display(), len, expected_len);
            return Ok(None);
        }

        let mime = self.sniff_mime(path)?;
        if !mime.starts_with("image/") {
            debug!("{} is {}, not an image", path.display(), mime);
            return Ok(None);
        }

        Ok(Some(DownloadedImage {
            path: path.to_owned(),
            len,
            mime,
        }))
    }

    fn sniff_mime(&self, path: &Path) -> Result<String, AcquireError> {
        let invocation = Invocation::new("file")
            .args(["-L", "--mime-type", "-b"])
            .arg(path.to_string_lossy());
        match self.runner.run(&invocation) {
            Ok(output) if output.success() => Ok(output.stdout.trim().to_owned()),
            Ok(output) => {
                debug!("file exited with {:?}: {}", output.code, output.stderr.trim());
                Ok(String::new())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(AcquireError::MissingDependency("file")),
            Err(err) => Err(AcquireError::Io(path.to_owned(), err)),
        }
    }
}

async fn remove(path: &Path) -> Result<(), AcquireError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AcquireError::Io(path.to_owned(), err)),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{image_url, FakeFetch};
    use super::*;
    use crate::command::fake::FakeRunner;

    const JPEG: &[u8] = b"\xff\xd8\xff\xe0 pretend jpeg";

    fn image_runner() -> Arc<FakeRunner> {
        let runner = FakeRunner::with_programs(&["file"]);
        runner.respond("file", 0, "image/jpeg\n");
        Arc::new(runner)
    }

    fn bing(fetch: &Arc<FakeFetch>, runner: &Arc<FakeRunner>) -> Bing {
        Bing::with_fetch(fetch.clone(), runner.clone()).retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn markets_parse_from_codes() {
        assert_eq!("en-US".parse::<Market>().unwrap(), Market::EnglishUS);
        assert_eq!("es-XL".parse::<Market>().unwrap(), Market::SpanishLatinAmerica);
        let err = "xx-XX".parse::<Market>().unwrap_err();
        assert!(err.to_string().contains("zh-CN"));
    }

    #[test]
    fn url_base_is_extracted_from_xml() {
        let xml = "<images><image><urlBase>/th?id=OHR.Foo_EN-US1</urlBase></image></images>";
        assert_eq!(extract_url_base(xml).as_deref(), Some("/th?id=OHR.Foo_EN-US1"));
        assert_eq!(extract_url_base("<images></images>"), None);
    }

    #[test]
    fn local_file_name_strips_query_prefix() {
        assert_eq!(
            local_file_name("https://www.bing.com/th?id=OHR.Foo_EN-US1_UHD.jpg"),
            "OHR.Foo_EN-US1_UHD.jpg"
        );
        assert_eq!(
            local_file_name("https://www.bing.com/az/hprichbg/rb/Foo_EN-US1_1366x768.jpg"),
            "Foo_EN-US1_1366x768.jpg"
        );
    }

    #[test]
    fn unreachable_network_is_recognised_through_the_source_chain() {
        let err = io::Error::from_raw_os_error(NETWORK_UNREACHABLE_OS_ERROR);
        assert!(is_network_unreachable(&err));
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(!is_network_unreachable(&err));
    }

    #[tokio::test]
    async fn acquire_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = image_runner();
        let bing = bing(&fetch, &runner);

        let first = bing.acquire(Market::EnglishUS, dir.path()).await.unwrap();
        let second = bing.acquire(Market::EnglishUS, dir.path()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.path, dir.path().join("OHR.Lighthouse_EN-US1234_UHD.jpg"));
        assert_eq!(first.len, JPEG.len() as u64);
        assert_eq!(first.mime, "image/jpeg");
        assert_eq!(fetch.body_reads(), 1);
    }

    #[tokio::test]
    async fn ladder_stops_at_first_served_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("1920x1080", JPEG);
        fetch.serve("1366x768", JPEG);
        let runner = image_runner();

        let image = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap();

        assert!(image.path.to_string_lossy().ends_with("_1920x1080.jpg"));
        assert_eq!(
            fetch.requested(),
            vec![image_url("UHD"), image_url("1920x1200"), image_url("1920x1080")]
        );
    }

    #[tokio::test]
    async fn redirected_resolution_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.redirect("UHD", "https://www.bing.com/sa/simg/hpb/NorthMale_EN-US8782628354_1920x1080.jpg", JPEG);
        fetch.serve("1920x1200", JPEG);
        let runner = image_runner();

        let image = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap();

        assert!(image.path.to_string_lossy().ends_with("_1920x1200.jpg"));
    }

    #[tokio::test]
    async fn size_mismatch_is_deleted_and_ladder_continues() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve_with_length("UHD", JPEG, JPEG.len() as u64 + 100);
        fetch.serve("1920x1200", JPEG);
        let runner = image_runner();

        let image = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap();

        assert!(image.path.to_string_lossy().ends_with("_1920x1200.jpg"));
        assert!(!dir.path().join("OHR.Lighthouse_EN-US1234_UHD.jpg").exists());
    }

    #[tokio::test]
    async fn all_mismatched_resolutions_mean_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        for resolution in RESOLUTIONS {
            fetch.serve_with_length(resolution, JPEG, 1);
        }
        let runner = image_runner();

        let err = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap_err();

        assert!(matches!(err, AcquireError::NoImageAvailable));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn error_page_served_with_200_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", b"<html>oops</html>");
        let runner = FakeRunner::with_programs(&["file"]);
        runner.respond("file", 0, "text/html\n");
        let runner = Arc::new(runner);

        let err = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap_err();

        assert!(matches!(err, AcquireError::NoImageAvailable));
    }

    #[tokio::test]
    async fn stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("OHR.Lighthouse_EN-US1234_UHD.jpg");
        std::fs::write(&path, b"partial").unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = image_runner();

        let image = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap();

        assert_eq!(image.path, path);
        assert_eq!(std::fs::read(&path).unwrap(), JPEG);
        assert_eq!(fetch.body_reads(), 1);
    }

    #[tokio::test]
    async fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Pictures").join("Bing");
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = image_runner();

        let image = bing(&fetch, &runner).acquire(Market::EnglishUS, &target).await.unwrap();

        assert!(image.path.starts_with(&target));
    }

    #[tokio::test]
    async fn missing_url_base_is_a_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::default());
        fetch.metadata("<images></images>");
        let runner = image_runner();

        let err = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap_err();

        assert!(matches!(err, AcquireError::Metadata));
        assert!(fetch.requested().is_empty());
    }

    #[tokio::test]
    async fn unreachable_network_is_retried() {
        let fetch = Arc::new(FakeFetch::new());
        fetch.unreachable_once();
        let runner = image_runner();

        let base = bing(&fetch, &runner).url_base(Market::GermanGermany).await.unwrap();

        assert_eq!(base, format!("https://www.bing.com{}", fake::URL_BASE));
    }

    #[tokio::test]
    async fn missing_mime_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = Arc::new(FakeRunner::default());

        let err = bing(&fetch, &runner).acquire(Market::EnglishUS, dir.path()).await.unwrap_err();

        assert!(matches!(err, AcquireError::MissingDependency("file")));
    }
}
