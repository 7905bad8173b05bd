//! Metric grouping engine: named groups of metrics, each combining a manual
//! member list with regex rules, resolved against a metric catalog.

pub mod app;
pub mod catalog;
pub mod config;
pub mod gateway;
pub mod index;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod state;

pub use app::AppContext;
pub use catalog::{Metric, MetricCatalog};
pub use gateway::{GroupPayload, PersistenceGateway, RemoteError};
pub use index::{Membership, MembershipIndex, Provenance};
pub use registry::{Group, GroupId, GroupRegistry, RegistryError};
pub use session::{GroupEditorSession, PreviewList, RowMode, SessionError};
pub use state::{OrderOutcome, SaveError, SaveOutcome, SaveStatus, SharedSession};
