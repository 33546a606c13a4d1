//! Auth Store and OAuth Refresher. Grouped into one
//! crate because the refresher must feed token updates back atomically
//! into the store, and both share the on-disk credential file format.

pub mod client;
pub mod oauth;
pub mod refresher;
pub mod store;

pub use client::{Client, ClientKind, ClientSnapshot, OAuthToken};
pub use refresher::{IdcFlow, KiroSocialFlow, OAuthRefresher, RefresherConfig, RefreshFlow};
pub use store::{AuthStore, AuthStoreError, ClientRecord};
