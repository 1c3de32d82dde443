/// Session context: who is logged in.
///
/// Passed explicitly to whatever needs it. Only the client facade mutates it,
/// through `establish` (login / restore) and `clear` (logout).
use crate::model::{Identity, Principal};
use tokio::sync::watch;

#[derive(Clone)]
pub struct Session {
    principal: watch::Sender<Option<Principal>>,
}

impl Session {
    pub fn new() -> Self {
        let (principal, _) = watch::channel(None);
        Self { principal }
    }

    /// Snapshot of the logged-in principal
    pub fn current(&self) -> Option<Principal> {
        self.principal.borrow().clone()
    }

    /// The logged-in user, if the principal is a user
    pub fn user(&self) -> Option<Identity> {
        match &*self.principal.borrow() {
            Some(Principal::User(identity)) => Some(identity.clone()),
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.user().map(|u| u.id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.borrow().is_some()
    }

    /// Follow login/logout transitions
    pub fn watch(&self) -> watch::Receiver<Option<Principal>> {
        self.principal.subscribe()
    }

    pub(crate) fn establish(&self, principal: Principal) {
        self.principal.send_replace(Some(principal));
    }

    pub(crate) fn clear(&self) -> Option<Principal> {
        self.principal.send_replace(None)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_mutation_path() {
        let session = Session::new();
        let mut rx = session.watch();
        assert!(!session.is_authenticated());

        session.establish(Principal::User(Identity::new("u1", "Ada")));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().map(|p| p.is_user()), Some(true));
        assert_eq!(session.user_id().as_deref(), Some("u1"));

        let previous = session.clear();
        assert!(matches!(previous, Some(Principal::User(_))));
        assert!(session.user().is_none());
    }

    #[test]
    fn test_company_is_not_a_user() {
        let session = Session::new();
        session.establish(Principal::Company(Identity::new("c1", "Acme")));
        assert!(session.is_authenticated());
        assert!(session.user_id().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let session = Session::new();
        let other = session.clone();
        session.establish(Principal::User(Identity::new("u2", "Bea")));
        assert_eq!(other.user_id().as_deref(), Some("u2"));
    }
}
