use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::promise::Resolver;
use super::super::auth::{AuthFailure, AuthResult};
use super::{AuthMethod, ResultSlot, request_header};

/// Prompts that the server wants the user to answer.
///
/// This corresponds to `SSH_MSG_USERAUTH_INFO_REQUEST` in the "keyboard-interactive" method (RFC
/// 4256, section 3.2). The server side uses the same struct to describe the prompts that it sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KbdInfoRequest {
    /// Name of the request (may be empty), for example a title of a dialog window.
    pub name: String,
    /// Instructions for the user (may be empty).
    pub instruction: String,
    /// Language tag (usually empty).
    pub lang: String,
    /// The prompts, each of them should be answered by one response.
    pub prompts: Vec<KbdPrompt>,
}

/// One prompt in a [`KbdInfoRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbdPrompt {
    /// The prompt text, such as `"Password: "`.
    pub prompt: String,
    /// True if the response may be displayed while the user types it.
    pub echo: bool,
}

/// Answers the prompts of the "keyboard-interactive" method.
///
/// The returned vector should have one response per prompt. If the number of responses differs,
/// we send them anyway and leave the decision to the server.
pub trait KbdInteractivePrompter {
    /// Answers the prompts in `request`.
    fn prompt(&self, request: &KbdInfoRequest) -> Vec<String>;
}

impl<F: Fn(&KbdInfoRequest) -> Vec<String>> KbdInteractivePrompter for F {
    fn prompt(&self, request: &KbdInfoRequest) -> Vec<String> {
        self(request)
    }
}

/// The "keyboard-interactive" method (RFC 4256).
pub struct AuthKbdInteractive {
    username: String,
    prompter: Arc<dyn KbdInteractivePrompter + Send + Sync>,
    request_sent: bool,
    responses: VecDeque<Vec<String>>,
    result: ResultSlot,
}

impl AuthKbdInteractive {
    pub fn new(
        username: String,
        prompter: Arc<dyn KbdInteractivePrompter + Send + Sync>,
        result_tx: Resolver<AuthResult>,
    ) -> AuthKbdInteractive {
        AuthKbdInteractive {
            username, prompter,
            request_sent: false,
            responses: VecDeque::new(),
            result: ResultSlot::new(result_tx),
        }
    }
}

pub(crate) fn decode_info_request(payload: &mut PacketDecode) -> Result<KbdInfoRequest> {
    let name = payload.get_string()?;
    let instruction = payload.get_string()?;
    let lang = payload.get_string()?;
    let prompt_count = payload.get_u32()?;
    let mut prompts = Vec::new();
    for _ in 0..prompt_count {
        prompts.push(KbdPrompt {
            prompt: payload.get_string()?,
            echo: payload.get_bool()?,
        });
    }
    Ok(KbdInfoRequest { name, instruction, lang, prompts })
}

pub(crate) fn encode_info_request(request: &KbdInfoRequest) -> Bytes {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::USERAUTH_INFO_REQUEST);
    payload.put_str(&request.name);
    payload.put_str(&request.instruction);
    payload.put_str(&request.lang);
    payload.put_u32(request.prompts.len() as u32);
    for prompt in request.prompts.iter() {
        payload.put_str(&prompt.prompt);
        payload.put_bool(prompt.echo);
    }
    payload.finish()
}

impl AuthMethod for AuthKbdInteractive {
    fn recv_success(&mut self) -> Result<()> {
        self.result.resolve(Ok(AuthResult::Success));
        Ok(())
    }

    fn recv_failure(&mut self, failure: AuthFailure) -> Result<()> {
        self.result.resolve(Ok(AuthResult::Failure(failure)));
        Ok(())
    }

    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        if msg_id != msg::USERAUTH_INFO_REQUEST || !self.request_sent {
            return Err(Error::PacketNotImplemented(msg_id))
        }

        let request = decode_info_request(payload)?;
        log::debug!("received SSH_MSG_USERAUTH_INFO_REQUEST with {} prompts", request.prompts.len());
        let responses = self.prompter.prompt(&request);
        if responses.len() != request.prompts.len() {
            log::warn!("sending {} responses to {} keyboard-interactive prompts",
                responses.len(), request.prompts.len());
        }
        self.responses.push_back(responses);
        Ok(())
    }

    fn send_packet(&mut self, _session_id: &[u8]) -> Result<Option<Bytes>> {
        if !self.request_sent {
            // RFC 4256, section 3.1
            let mut payload = request_header(&self.username, "keyboard-interactive");
            payload.put_str(""); // language tag
            payload.put_str(""); // submethods
            log::debug!("sending SSH_MSG_USERAUTH_REQUEST for method 'keyboard-interactive'");
            self.request_sent = true;
            return Ok(Some(payload.finish()))
        }

        if let Some(responses) = self.responses.pop_front() {
            let mut payload = PacketEncode::new();
            payload.put_u8(msg::USERAUTH_INFO_RESPONSE);
            payload.put_u32(responses.len() as u32);
            for response in responses.iter() {
                payload.put_str(response);
            }
            log::debug!("sending SSH_MSG_USERAUTH_INFO_RESPONSE");
            return Ok(Some(payload.finish()))
        }

        Ok(None)
    }

    fn is_done(&self) -> bool {
        self.result.is_done()
    }

    fn abort(&mut self, err: Error) {
        self.result.resolve(Err(err));
    }
}
