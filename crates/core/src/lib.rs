pub mod config;
pub mod error;
pub mod fakes;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{AttributeReadError, StoreError, StoreResult};
pub use store::{MetricStore, SegmentRecord, SegmentStore};
pub use types::{AttributeSet, OrderEvent, Scalar, Sequence, UserMetrics};
