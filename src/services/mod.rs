pub mod download_manager;
pub mod fetcher;
pub mod input_source;
pub mod range_loader;
pub mod registry;

pub use download_manager::{DownloadEvent, DownloadManager, Remuxer};
pub use fetcher::{ByteRange, FetchResponse, HttpRangeFetcher, RangeFetcher};
pub use input_source::{InputSourceHandle, StreamingInputSource};
pub use range_loader::{ContentInfo, DataRequest, DataSink, RangeResourceLoader};
pub use registry::{TrackRegistry, TRACK_URL_SCHEME};
