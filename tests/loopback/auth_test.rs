use anyhow::{bail, Result};
use hashi::{
    codes, AuthCredentials, AuthRequestMethod, AuthResponse, AuthResult, KbdInfoRequest,
    KbdInteractivePrompter, KbdPrompt, Phase, SessionConfig, SessionEvent,
};
use std::sync::Arc;
use crate::harness::{self, client_key, other_key, server_config, USERNAME, PASSWORD};

#[tokio::test]
async fn test_auth_none_lists_methods() -> Result<()> {
    let config = server_config().with(|c| c.auth_methods = vec!["publickey".into(), "password".into()]);
    let pair = harness::start(SessionConfig::default(), config, harness::default_policy())?;

    match pair.client.session.auth_none(USERNAME.into()).await? {
        AuthResult::Failure(failure) => {
            assert_eq!(failure.methods_can_continue, vec!["publickey".to_string(), "password".to_string()]);
            assert!(!failure.partial_success);
        },
        res => bail!("expected failure, got {:?}", res),
    }
    assert_eq!(pair.client.session.phase(), Phase::Authenticating);
    assert!(!pair.server.session.is_authenticated()?);

    let credentials = AuthCredentials::default().with(|c| c.password = Some(PASSWORD.into()));
    pair.client.session.authenticate(USERNAME, credentials).await?;
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_pubkey() -> Result<()> {
    let pair = harness::start(SessionConfig::default(), server_config(), harness::default_policy())?;
    let credentials = AuthCredentials::default().with(|c| c.privkeys = vec![other_key(), client_key()]);
    pair.client.session.authenticate(USERNAME, credentials).await?;

    assert!(pair.client.session.is_authenticated()?);
    assert!(pair.server.session.is_authenticated()?);
    assert_eq!(pair.server.session.phase(), Phase::Connected);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_password_wrong_then_right() -> Result<()> {
    let pair = harness::start(SessionConfig::default(), server_config(), harness::default_policy())?;

    let res = pair.client.session.auth_password(USERNAME.into(), "hunter2".into()).await?;
    assert!(matches!(res, AuthResult::Failure(_)));
    assert!(matches!(res.success_or_error(), Err(hashi::Error::AuthFailed)));

    let res = pair.client.session.auth_password(USERNAME.into(), PASSWORD.into()).await?;
    assert!(matches!(res, AuthResult::Success));
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_password_change() -> Result<()> {
    let policy: harness::AuthPolicy = Arc::new(|_: &str, method: &AuthRequestMethod| match method {
        AuthRequestMethod::Password { password, new_password: Some(new_password) }
            if password == PASSWORD && new_password == "new secret" => AuthResponse::Accept,
        _ => AuthResponse::Reject,
    });
    let pair = harness::start(SessionConfig::default(), server_config(), policy)?;

    let res = pair.client.session.auth_password_change(
        USERNAME.into(), PASSWORD.into(), "new secret".into()).await?;
    assert!(matches!(res, AuthResult::Success));
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_keyboard_interactive() -> Result<()> {
    let policy: harness::AuthPolicy = Arc::new(|_: &str, method: &AuthRequestMethod| match method {
        AuthRequestMethod::KeyboardInteractive { responses: None, .. } =>
            AuthResponse::InfoRequest(KbdInfoRequest {
                instruction: "Answer the question".into(),
                prompts: vec![KbdPrompt { prompt: "Meaning of life: ".into(), echo: true }],
                ..Default::default()
            }),
        AuthRequestMethod::KeyboardInteractive { responses: Some(responses), .. }
            if responses == &["42".to_string()] => AuthResponse::Accept,
        _ => AuthResponse::Reject,
    });
    let pair = harness::start(SessionConfig::default(), server_config(), policy)?;

    let prompter: Arc<dyn KbdInteractivePrompter + Send + Sync> = Arc::new(|request: &KbdInfoRequest| {
        assert_eq!(request.instruction, "Answer the question");
        vec!["42".to_string(); request.prompts.len()]
    });
    let credentials = AuthCredentials::default().with(|c| c.kbd_interactive = Some(prompter));
    pair.client.session.authenticate(USERNAME, credentials).await?;
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_partial_success() -> Result<()> {
    let policy: harness::AuthPolicy = Arc::new(|_: &str, method: &AuthRequestMethod| match method {
        AuthRequestMethod::Pubkey { signed: true, .. } => AuthResponse::PartialSuccess,
        AuthRequestMethod::Pubkey { signed: false, .. } => AuthResponse::Accept,
        AuthRequestMethod::Password { password, .. } if password == PASSWORD => AuthResponse::Accept,
        _ => AuthResponse::Reject,
    });
    let pair = harness::start(SessionConfig::default(), server_config(), policy)?;

    let res = pair.client.session.auth_pubkey(USERNAME.into(), client_key(), &hashi::pubkey::SSH_ED25519).await?;
    match res {
        AuthResult::Failure(failure) => {
            assert!(failure.partial_success);
            assert!(!failure.methods_can_continue.iter().any(|m| m == "publickey"));
        },
        res => bail!("expected partial success, got {:?}", res),
    }
    assert!(!pair.client.session.is_authenticated()?);

    let credentials = AuthCredentials::default().with(|c| c.password = Some(PASSWORD.into()));
    pair.client.session.authenticate(USERNAME, credentials).await?;
    assert!(pair.client.session.is_authenticated()?);
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_banner() -> Result<()> {
    let config = server_config().with(|c| c.auth_banner = Some("Authorized users only\r\n".into()));
    let mut pair = harness::connected(SessionConfig::default(), config).await?;

    match harness::next_event(&mut pair.client.events).await? {
        SessionEvent::AuthBanner(banner) => assert_eq!(banner.message, "Authorized users only\r\n"),
        event => bail!("expected a banner, got {:?}", event),
    }
    harness::finish(pair).await
}

#[tokio::test]
async fn test_auth_exhausted() -> Result<()> {
    let config = server_config().with(|c| {
        c.auth_methods = vec!["publickey".into(), "password".into()];
        c.max_auth_attempts = 2;
    });
    let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let policy: harness::AuthPolicy = {
        let tried = tried.clone();
        Arc::new(move |_: &str, method: &AuthRequestMethod| {
            tried.lock().push(method.name());
            AuthResponse::Reject
        })
    };
    let pair = harness::start(SessionConfig::default(), config, policy)?;

    // one key and a password, so the server gives up after the password
    let credentials = AuthCredentials::default().with(|c| {
        c.privkeys = vec![client_key()];
        c.password = Some(PASSWORD.into());
    });
    match pair.client.session.authenticate(USERNAME, credentials).await {
        Err(hashi::Error::PeerDisconnected(error)) =>
            assert_eq!(error.reason_code, codes::disconnect::NO_MORE_AUTH_METHODS_AVAILABLE),
        res => bail!("expected the server to disconnect, got {:?}", res),
    }
    assert_eq!(*tried.lock(), vec!["publickey", "password"]);

    assert!(matches!(pair.server.task.await?, Err(hashi::Error::AuthExhausted)));
    match pair.client.task.await? {
        Err(hashi::Error::PeerDisconnected(error)) =>
            assert_eq!(error.reason_code, codes::disconnect::NO_MORE_AUTH_METHODS_AVAILABLE),
        res => bail!("expected the client session to end with a disconnect, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_auth_failed_when_methods_run_out() -> Result<()> {
    let config = server_config().with(|c| c.auth_methods = vec!["publickey".into()]);
    let pair = harness::start(SessionConfig::default(), config, harness::default_policy())?;

    // the server does not offer "password", so the client has nothing to try
    let credentials = AuthCredentials::default().with(|c| c.password = Some(PASSWORD.into()));
    match pair.client.session.authenticate(USERNAME, credentials).await {
        Err(hashi::Error::AuthFailed) => {},
        res => bail!("expected authentication to fail, got {:?}", res),
    }

    assert!(pair.client.task.await?.is_ok());
    match pair.server.task.await? {
        Err(hashi::Error::PeerDisconnected(error)) =>
            assert_eq!(error.reason_code, codes::disconnect::NO_MORE_AUTH_METHODS_AVAILABLE),
        res => bail!("expected the client to disconnect, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_auth_on_server_is_wrong_role() -> Result<()> {
    let pair = harness::start(SessionConfig::default(), server_config(), harness::default_policy())?;
    let res = pair.server.session.auth_none(USERNAME.into()).await;
    assert!(matches!(res, Err(hashi::Error::WrongRole)));

    let credentials = AuthCredentials::default().with(|c| c.password = Some(PASSWORD.into()));
    pair.client.session.authenticate(USERNAME, credentials).await?;
    harness::finish(pair).await
}
