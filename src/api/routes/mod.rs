//! API route handlers, grouped by surface:
//! - [`items`] — work item listing, detail, progress, reprocess, cancel
//! - [`chat`] — chat transcript window and paced replay stream
//! - [`admin`] — credentialed operator endpoints
//! - [`system`] — liveness, readiness, status, OpenAPI

pub mod admin;
pub mod chat;
pub mod items;
pub mod system;

pub use self::admin::{
    get_admin_config, monitor_summary, run_backfill, run_discovery, set_item_priority,
    set_item_skip_upload, update_admin_config,
};
pub use self::chat::{chat_stream, chat_window};
pub use self::items::{cancel_item, get_item, item_progress, list_items, reprocess_item};
pub use self::system::{healthz, openapi_spec, readyz, status};
