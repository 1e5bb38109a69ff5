use derivative::Derivative;
use std::sync::Arc;
use crate::codes::disconnect;
use crate::error::{DisconnectError, Error, Result};
use crate::pubkey::Privkey;
use super::auth::AuthResult;
use super::auth_method::keyboard_interactive::KbdInteractivePrompter;
use super::session::Session;
use super::state::Phase;

/// Credentials for [`Session::authenticate()`].
///
/// Methods without credentials are skipped.
#[derive(Derivative, Clone, Default)]
#[derivative(Debug)]
#[non_exhaustive]
pub struct AuthCredentials {
    /// Private keys for the "publickey" method, tried in this order.
    #[derivative(Debug = "ignore")]
    pub privkeys: Vec<Privkey>,

    /// Password for the "password" method.
    #[derivative(Debug = "ignore")]
    pub password: Option<String>,

    /// Prompter for the "keyboard-interactive" method.
    #[derivative(Debug = "ignore")]
    pub kbd_interactive: Option<Arc<dyn KbdInteractivePrompter + Send + Sync>>,
}

impl AuthCredentials {
    /// Mutate `self` in a closure.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }
}

/// Methods that the server allows us to try next.
struct Allowed {
    methods: Vec<String>,
}

impl Allowed {
    fn contains(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Updates the allowed methods from the result of an attempt. Returns true on success.
    fn update(&mut self, method: &str, result: AuthResult) -> bool {
        match result {
            AuthResult::Success => {
                log::debug!("authenticated with method {:?}", method);
                return true
            },
            AuthResult::Failure(failure) => {
                log::debug!("method {:?} failed (partial success {}), server allows {:?}",
                    method, failure.partial_success, failure.methods_can_continue);
                self.methods = failure.methods_can_continue;
            },
            AuthResult::ChangePassword(_) => {
                log::debug!("server asks to change the password, treating method {:?} as failed", method);
            },
        }
        false
    }
}

pub(super) async fn authenticate(
    session: &Session,
    username: &str,
    credentials: AuthCredentials,
    kbd_interactive_trials: u32,
) -> Result<()> {
    let mut allowed = Allowed { methods: Vec::new() };
    if allowed.update("none", session.auth_none(username.into()).await?) {
        return Ok(())
    }

    for privkey in credentials.privkeys.iter() {
        if !allowed.contains("publickey") {
            break
        }
        let pubkey = privkey.pubkey();
        let Some(&pubkey_algo) = pubkey.algos_secure().first() else {
            log::debug!("skipping key {} without a secure algorithm", pubkey);
            continue
        };

        match session.auth_pubkey(username.into(), privkey.clone(), pubkey_algo).await {
            Ok(result) => if allowed.update("publickey", result) {
                return Ok(())
            },
            // failure to sign with one key does not stop us from trying the others
            Err(err) if is_session_alive(session) => {
                log::debug!("could not authenticate with key {}: {}", pubkey, err);
            },
            Err(err) => return Err(err),
        }
    }

    if let Some(prompter) = credentials.kbd_interactive.as_ref() {
        for _ in 0..kbd_interactive_trials {
            if !allowed.contains("keyboard-interactive") {
                break
            }
            let result = session.auth_keyboard_interactive(username.into(), prompter.clone()).await?;
            if allowed.update("keyboard-interactive", result) {
                return Ok(())
            }
        }
    }

    if let Some(password) = credentials.password {
        if allowed.contains("password") {
            let result = session.auth_password(username.into(), password).await?;
            if allowed.update("password", result) {
                return Ok(())
            }
        }
    }

    log::debug!("no authentication method succeeded");
    let error = DisconnectError::new(disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
        "no more authentication methods available");
    // the session may already be closing, the caller learns about the failure either way
    let _: Result<()> = session.disconnect(error);
    Err(Error::AuthFailed)
}

fn is_session_alive(session: &Session) -> bool {
    !matches!(session.phase(), Phase::Disconnecting | Phase::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AuthFailure, AuthPasswordPrompt};

    #[test]
    fn test_allowed_follows_server_list() {
        let mut allowed = Allowed { methods: Vec::new() };
        let failure = AuthFailure {
            methods_can_continue: vec!["publickey".into(), "password".into()],
            partial_success: false,
        };
        assert!(!allowed.update("none", AuthResult::Failure(failure)));
        assert!(allowed.contains("publickey"));
        assert!(allowed.contains("password"));
        assert!(!allowed.contains("keyboard-interactive"));

        let prompt = AuthPasswordPrompt { prompt: "change".into(), prompt_lang: "".into() };
        assert!(!allowed.update("password", AuthResult::ChangePassword(prompt)));
        assert!(allowed.contains("password"));

        assert!(allowed.update("password", AuthResult::Success));
    }
}
