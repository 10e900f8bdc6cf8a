use tether_core::errors::TransportError;
use tether_core::events::StreamMeta;

use crate::frames::Payload;

type MetaFn = Box<dyn FnMut(StreamMeta) + Send>;
type TokenFn = Box<dyn FnMut(&str) + Send>;
type DoneFn = Box<dyn FnMut(String) + Send>;
type ErrorFn = Box<dyn FnMut(TransportError) + Send>;

/// Caller-supplied callbacks for one stream session. All optional.
#[derive(Default)]
pub struct StreamCallbacks {
    meta: Option<MetaFn>,
    token: Option<TokenFn>,
    done: Option<DoneFn>,
    error: Option<ErrorFn>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_meta(mut self, f: impl FnMut(StreamMeta) + Send + 'static) -> Self {
        self.meta = Some(Box::new(f));
        self
    }

    pub fn on_token(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.token = Some(Box::new(f));
        self
    }

    pub fn on_done(mut self, f: impl FnMut(String) + Send + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(TransportError) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

/// What the read loop should do after a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadOutcome {
    Continue,
    /// `[DONE]` observed (or the session already terminated); stop reading.
    Completed,
}

/// State for one streaming request.
///
/// Owns the accumulated text and the one-shot flags; terminates exactly once,
/// through either [`StreamSession::finish`] or [`StreamSession::fail`].
/// Tokens append in arrival order; metadata is reported at most once, first
/// instance wins.
pub struct StreamSession {
    accumulated: String,
    meta_seen: bool,
    terminated: bool,
    callbacks: StreamCallbacks,
}

impl StreamSession {
    pub fn new(callbacks: StreamCallbacks) -> Self {
        Self {
            accumulated: String::new(),
            meta_seen: false,
            terminated: false,
            callbacks,
        }
    }

    /// Route one classified payload to the callbacks.
    pub fn on_payload(&mut self, payload: Payload) -> PayloadOutcome {
        if self.terminated {
            return PayloadOutcome::Completed;
        }

        match payload {
            Payload::Done => {
                self.finish();
                PayloadOutcome::Completed
            }
            Payload::Meta(meta) => {
                if !self.meta_seen {
                    self.meta_seen = true;
                    if let Some(cb) = self.callbacks.meta.as_mut() {
                        cb(meta);
                    }
                }
                PayloadOutcome::Continue
            }
            Payload::Token(token) => {
                self.accumulated.push_str(&token);
                if let Some(cb) = self.callbacks.token.as_mut() {
                    cb(&token);
                }
                PayloadOutcome::Continue
            }
            Payload::Ignored => PayloadOutcome::Continue,
        }
    }

    /// Complete the session with whatever text accumulated. Idempotent, and a
    /// no-op after [`StreamSession::fail`]. Fires for `[DONE]`, end-of-input,
    /// and cancellation alike.
    pub fn finish(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Some(cb) = self.callbacks.done.as_mut() {
            cb(std::mem::take(&mut self.accumulated));
        }
    }

    /// Terminate the session with a transport-fatal error. Idempotent, and a
    /// no-op after [`StreamSession::finish`].
    pub fn fail(&mut self, error: TransportError) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Some(cb) = self.callbacks.error.as_mut() {
            cb(error);
        }
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_session() -> (StreamSession, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let callbacks = StreamCallbacks::new()
            .on_meta({
                let log = Arc::clone(&log);
                move |meta| log.lock().unwrap().push(format!("meta:{}", meta.message_id))
            })
            .on_token({
                let log = Arc::clone(&log);
                move |token| log.lock().unwrap().push(format!("token:{token}"))
            })
            .on_done({
                let log = Arc::clone(&log);
                move |text| log.lock().unwrap().push(format!("done:{text}"))
            })
            .on_error({
                let log = Arc::clone(&log);
                move |err| log.lock().unwrap().push(format!("error:{}", err.error_kind()))
            });
        (StreamSession::new(callbacks), log)
    }

    fn meta(conv: &str, msg: &str) -> Payload {
        crate::frames::classify(&format!(
            r#"{{"conversation_id":"{conv}","message_id":"{msg}"}}"#
        ))
    }

    #[test]
    fn tokens_accumulate_in_order() {
        let (mut session, log) = recording_session();
        session.on_payload(meta("c1", "m1"));
        session.on_payload(Payload::Token("Hel".into()));
        session.on_payload(Payload::Token("lo".into()));
        assert_eq!(session.on_payload(Payload::Done), PayloadOutcome::Completed);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["meta:m1", "token:Hel", "token:lo", "done:Hello"]
        );
    }

    #[test]
    fn meta_reported_once_first_wins() {
        let (mut session, log) = recording_session();
        session.on_payload(meta("c1", "m1"));
        session.on_payload(meta("c2", "m2"));
        session.on_payload(Payload::Done);

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.starts_with("meta:")).count(), 1);
        assert_eq!(log[0], "meta:m1");
    }

    #[test]
    fn finish_is_exactly_once() {
        let (mut session, log) = recording_session();
        session.on_payload(Payload::Token("partial".into()));
        session.finish();
        session.finish();
        session.on_payload(Payload::Done);

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|e| e.starts_with("done:")).count(), 1);
        assert_eq!(log.last().unwrap(), "done:partial");
    }

    #[test]
    fn no_tokens_delivered_after_termination() {
        let (mut session, log) = recording_session();
        session.finish();
        let outcome = session.on_payload(Payload::Token("late".into()));
        assert_eq!(outcome, PayloadOutcome::Completed);
        assert!(!log.lock().unwrap().iter().any(|e| e.contains("late")));
    }

    #[test]
    fn fail_suppresses_done_and_vice_versa() {
        let (mut session, log) = recording_session();
        session.fail(TransportError::Unauthorized("expired".into()));
        session.finish();
        assert_eq!(*log.lock().unwrap(), vec!["error:unauthorized"]);

        let (mut session, log) = recording_session();
        session.finish();
        session.fail(TransportError::Network("late".into()));
        assert_eq!(*log.lock().unwrap(), vec!["done:"]);
    }

    #[test]
    fn empty_token_is_reported() {
        let (mut session, log) = recording_session();
        session.on_payload(Payload::Token(String::new()));
        session.finish();
        assert_eq!(*log.lock().unwrap(), vec!["token:", "done:"]);
    }

    #[test]
    fn eof_without_done_completes_with_accumulated() {
        let (mut session, log) = recording_session();
        session.on_payload(Payload::Token("half".into()));
        // Reader hit end-of-input without a [DONE] sentinel
        session.finish();
        assert_eq!(log.lock().unwrap().last().unwrap(), "done:half");
    }

    #[test]
    fn ignored_payloads_do_not_disturb_state() {
        let (mut session, log) = recording_session();
        assert_eq!(
            session.on_payload(Payload::Ignored),
            PayloadOutcome::Continue
        );
        session.on_payload(Payload::Token("ok".into()));
        session.on_payload(Payload::Done);
        assert_eq!(log.lock().unwrap().last().unwrap(), "done:ok");
    }
}
