/// REST backend seen from the client.
///
/// The route strings live in the HTTP implementation; everything above this
/// trait only deals with typed operations.
pub mod rest;

use crate::error::Result;
use crate::model::{ConnectionSummary, Conversation, Identity, Message};
use std::future::Future;

pub use self::rest::HttpBackend;

pub trait Backend: Send + Sync + 'static {
    /// The user bound to the current session. `Ok(None)` on 401.
    fn authenticated_user(&self) -> impl Future<Output = Result<Option<Identity>>> + Send;

    /// The company bound to the current session. `Ok(None)` on 401.
    fn authenticated_company(&self) -> impl Future<Output = Result<Option<Identity>>> + Send;

    fn login_user(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// End the session; `company` selects the company logout route
    fn logout(&self, company: bool) -> impl Future<Output = Result<()>> + Send;

    fn connections(&self) -> impl Future<Output = Result<Vec<ConnectionSummary>>> + Send;

    /// History between the session user and `peer_id`, oldest first
    fn conversation(&self, peer_id: &str) -> impl Future<Output = Result<Conversation>> + Send;

    fn send_message(
        &self,
        peer_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<Message>> + Send;

    /// Only the sender may delete; the backend enforces it
    fn delete_message(&self, message_id: &str) -> impl Future<Output = Result<()>> + Send;
}
