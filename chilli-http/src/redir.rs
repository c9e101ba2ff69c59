//! The per-connection UAM state machine.
//!
//! Every accepted connection walks `GetRequest → GetState → Process →
//! Radius → Reply`, each stage under its own budget. Whatever happens, the
//! client gets exactly one reply.

use crate::reply::{self, HttpReply};
use crate::request::{read_request, UamRequest};
use chilli_core::{
    Config, Credential, ChallengeStore, MsgKind, RadiusAuthenticator, RadiusCredential,
    RadiusOutcome, RadiusRequest, RadiusResponse, RedirConn, ReplyCode, RequestKind,
    SessionAuthority, Stage, RADIUS_ATTR_VLEN, REDIR_CHALLEN, REDIR_MD5LEN,
};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFailure {
    TimedOut,
    Error,
}

/// What happened to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: Option<RequestKind>,
    /// `None` for content replies (about, static, msdownload).
    pub code: Option<ReplyCode>,
    pub status: u16,
    pub failures: Vec<(Stage, StageFailure)>,
}

/// One listener instance: immutable configuration plus its collaborators.
pub struct Redir {
    config: Arc<Config>,
    challenges: Arc<ChallengeStore>,
    authority: Arc<dyn SessionAuthority>,
    radius: Arc<dyn RadiusAuthenticator>,
}

struct Handling {
    conn: RedirConn,
    failures: Vec<(Stage, StageFailure)>,
}

impl Handling {
    fn fail(&mut self, stage: Stage, failure: StageFailure) {
        self.failures.push((stage, failure));
    }
}

impl Redir {
    pub fn new(
        config: Arc<Config>,
        challenges: Arc<ChallengeStore>,
        authority: Arc<dyn SessionAuthority>,
        radius: Arc<dyn RadiusAuthenticator>,
    ) -> Self {
        Redir {
            config,
            challenges,
            authority,
            radius,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }

    /// Installs a challenge chosen elsewhere for `addr`.
    pub fn set_challenge(&self, addr: Ipv4Addr, challenge: [u8; REDIR_CHALLEN]) {
        self.challenges.set(addr, challenge);
    }

    async fn within<F: Future>(
        &self,
        h: &mut Handling,
        stage: Stage,
        fut: F,
    ) -> Option<F::Output> {
        match tokio::time::timeout(self.config.timeouts.budget(stage), fut).await {
            Ok(out) => Some(out),
            Err(_) => {
                warn!(client = %h.conn.hisip, ?stage, "stage timed out");
                h.fail(stage, StageFailure::TimedOut);
                None
            }
        }
    }

    /// Serves one connection from `peer` and closes it.
    pub async fn handle<S>(&self, stream: &mut S, peer: Ipv4Addr) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut h = Handling {
            conn: RedirConn::new(peer, self.config.uamlisten),
            failures: Vec::new(),
        };

        let request = match self.within(&mut h, Stage::GetRequest, read_request(stream)).await {
            Some(Ok(req)) => Some(req),
            Some(Err(e)) => {
                warn!(client = %peer, stage = ?Stage::GetRequest, "rejecting request: {}", e);
                h.fail(Stage::GetRequest, StageFailure::Error);
                None
            }
            None => None,
        };

        let kind = request.as_ref().map(|r| r.kind);
        let (code, reply) = match request {
            Some(req) => self.process(&mut h, req).await,
            None => {
                let code = ReplyCode::FailedOther;
                (Some(code), reply::render(code, &h.conn, &self.config))
            }
        };

        match self.within(&mut h, Stage::Reply, reply::write_reply(stream, &reply)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(client = %peer, stage = ?Stage::Reply, "failed to send reply: {}", e);
                h.fail(Stage::Reply, StageFailure::Error);
            }
            None => {}
        }

        info!(
            client = %peer,
            ?kind,
            ?code,
            status = reply.status,
            failures = h.failures.len(),
            "UAM request done"
        );
        Outcome {
            kind,
            code,
            status: reply.status,
            failures: h.failures,
        }
    }

    async fn process(&self, h: &mut Handling, req: UamRequest) -> (Option<ReplyCode>, HttpReply) {
        let peer = h.conn.hisip;
        h.conn.kind = req.kind;
        if let Some(username) = req.username {
            h.conn.username = username;
        }
        if let Some(userurl) = req.userurl {
            h.conn.userurl = userurl;
        }
        h.conn.credential = req.credential;
        h.conn.presented_challenge = req.challenge;

        match self.within(h, Stage::GetState, self.authority.get_state(peer)).await {
            Some(Some(snapshot)) => h.conn.apply_snapshot(snapshot),
            Some(None) => debug!(client = %peer, "no session known for client"),
            None => warn!(client = %peer, "session authority did not answer, treating client as unknown"),
        }

        let code = match req.kind {
            RequestKind::Login => self.login(h).await,
            RequestKind::Logout => self.terminate(h, MsgKind::Logout),
            RequestKind::Abort => self.terminate(h, MsgKind::Abort),
            RequestKind::Challenge => {
                self.issue_challenge(h);
                if h.conn.authenticated {
                    ReplyCode::Already
                } else {
                    ReplyCode::NotYet
                }
            }
            RequestKind::About => return (None, reply::about(&self.config)),
            RequestKind::MsDownload => {
                self.issue_challenge(h);
                return (None, reply::msdownload(&h.conn, &self.config));
            }
            RequestKind::Static => {
                let name = req.file.unwrap_or_default();
                return match self.within(h, Stage::Process, self.read_static(&name)).await {
                    Some(reply) => (None, reply),
                    None => {
                        let code = ReplyCode::FailedOther;
                        (Some(code), reply::render(code, &h.conn, &self.config))
                    }
                };
            }
            RequestKind::Prelogin | RequestKind::Admin => {
                if h.conn.authenticated {
                    ReplyCode::Already
                } else {
                    self.issue_challenge(h);
                    ReplyCode::NotYet
                }
            }
        };
        (Some(code), reply::render(code, &h.conn, &self.config))
    }

    fn issue_challenge(&self, h: &mut Handling) {
        let peer = h.conn.hisip;
        match self.challenges.issue(peer) {
            Ok(_) => {
                if let Some(challenge) = self.challenges.get(peer) {
                    h.conn.set_challenge(&challenge);
                }
            }
            Err(e) => {
                error!(client = %peer, "could not generate challenge: {}", e);
                h.fail(Stage::Process, StageFailure::Error);
            }
        }
    }

    fn post(&self, h: &Handling, kind: MsgKind) {
        let peer = h.conn.hisip;
        match self.authority.publish(h.conn.to_msg(kind)) {
            Ok(()) => debug!(client = %peer, ?kind, "posted session message"),
            Err(e) => warn!(client = %peer, ?kind, "dropping session message: {}", e),
        }
    }

    fn terminate(&self, h: &mut Handling, kind: MsgKind) -> ReplyCode {
        if !h.conn.authenticated {
            return match kind {
                MsgKind::Abort => ReplyCode::AbortNak,
                _ => ReplyCode::Logoff,
            };
        }
        self.post(h, kind);
        info!(client = %h.conn.hisip, username = %h.conn.username, ?kind, "session ended by client");
        h.conn.authenticated = false;
        h.conn.timeleft = None;
        match kind {
            MsgKind::Abort => ReplyCode::AbortAck,
            _ => ReplyCode::Logoff,
        }
    }

    /// The challenge RADIUS sees: the issued one, hashed with the UAM
    /// secret when one is configured.
    fn radius_challenge(&self, uamchal: &[u8; REDIR_CHALLEN]) -> [u8; REDIR_MD5LEN] {
        match self.config.uam_secret() {
            Some(secret) => {
                let mut ctx = md5::Context::new();
                ctx.consume(uamchal);
                ctx.consume(secret.as_bytes());
                ctx.compute().0
            }
            None => *uamchal,
        }
    }

    fn radius_credential(&self, conn: &RedirConn) -> Option<RadiusCredential> {
        let challenge = self.radius_challenge(&conn.uamchal);
        match &conn.credential {
            Credential::None => None,
            Credential::Password(masked) => {
                let mut password: Vec<u8> = masked
                    .iter()
                    .zip(challenge.iter().cycle())
                    .map(|(p, k)| p ^ k)
                    .collect();
                while password.last() == Some(&0) {
                    password.pop();
                }
                Some(RadiusCredential::Pap(password))
            }
            Credential::Chap(response) => Some(RadiusCredential::Chap {
                challenge,
                response: *response,
            }),
        }
    }

    fn refuse(&self, h: &mut Handling, code: ReplyCode) -> ReplyCode {
        // Give the portal something to retry with.
        self.issue_challenge(h);
        code
    }

    async fn login(&self, h: &mut Handling) -> ReplyCode {
        let peer = h.conn.hisip;
        if h.conn.authenticated {
            info!(client = %peer, "login while already authenticated");
            return ReplyCode::Already;
        }
        if h.conn.username.is_empty() || h.conn.credential == Credential::None {
            warn!(client = %peer, "login without username or credential");
            return self.refuse(h, ReplyCode::FailedOther);
        }
        if h.conn.username.len() > RADIUS_ATTR_VLEN {
            warn!(
                client = %peer,
                len = h.conn.username.len(),
                "username does not fit a RADIUS User-Name, refusing login"
            );
            return self.refuse(h, ReplyCode::FailedOther);
        }

        let challenge = match self.challenges.take_fresh(
            peer,
            h.conn.presented_challenge.as_ref(),
            self.config.challenge_window(),
        ) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(client = %peer, username = %h.conn.username, "login refused: {}", e);
                return self.refuse(h, ReplyCode::FailedOther);
            }
        };
        h.conn.set_challenge(&challenge);

        let Some(credential) = self.radius_credential(&h.conn) else {
            return self.refuse(h, ReplyCode::FailedOther);
        };
        let request = RadiusRequest {
            username: h.conn.username.clone(),
            credential,
            hisip: peer,
            hismac: h.conn.hismac,
            nasport: h.conn.nasport,
            sessionid: h.conn.sessionid.clone(),
            state: h.conn.state.clone(),
        };

        let outcome = self
            .within(h, Stage::Radius, self.radius.authenticate(request))
            .await
            .unwrap_or(RadiusOutcome::Timeout);

        match outcome {
            RadiusOutcome::Accept(accept) => {
                h.conn.apply_accept(accept);
                self.post(h, MsgKind::Login);
                info!(
                    client = %peer,
                    username = %h.conn.username,
                    sessionid = %h.conn.sessionid,
                    "login accepted"
                );
                ReplyCode::Success
            }
            RadiusOutcome::Reject { reply } => {
                info!(client = %peer, username = %h.conn.username, "login rejected");
                h.conn.response = RadiusResponse::Reject;
                h.conn.reply = reply;
                self.refuse(h, ReplyCode::FailedReject)
            }
            RadiusOutcome::Timeout => {
                error!(client = %peer, username = %h.conn.username, "no answer from RADIUS");
                h.conn.response = RadiusResponse::Timeout;
                self.refuse(h, ReplyCode::FailedOther)
            }
        }
    }

    async fn read_static(&self, name: &str) -> HttpReply {
        let Some(dir) = &self.config.wwwdir else {
            debug!(file = name, "no wwwdir configured");
            return reply::not_found();
        };
        match tokio::fs::read(dir.join(name)).await {
            Ok(body) => reply::static_content(name, body),
            Err(e) => {
                debug!(file = name, "static file unavailable: {}", e);
                reply::not_found()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chilli_core::{
        PostError, RadiusAccept, RedirMsg, SessionParams, SessionSnapshot, AttrString,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 5);
    const OTHER: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 6);

    /// Authority that applies what it is told right away and expires
    /// sessions on the tokio clock.
    #[derive(Default)]
    struct FakeAuthority {
        sessions: Mutex<HashMap<Ipv4Addr, (SessionSnapshot, Instant)>>,
        published: Mutex<Vec<RedirMsg>>,
        lookups: AtomicUsize,
        hang: bool,
    }

    impl FakeAuthority {
        fn hanging() -> Self {
            FakeAuthority {
                hang: true,
                ..Default::default()
            }
        }

        fn authenticate(&self, addr: Ipv4Addr) {
            let snap = SessionSnapshot {
                authenticated: true,
                ..Default::default()
            };
            self.sessions.lock().unwrap().insert(addr, (snap, Instant::now()));
        }

        fn published(&self) -> Vec<RedirMsg> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionAuthority for FakeAuthority {
        async fn get_state(&self, addr: Ipv4Addr) -> Option<SessionSnapshot> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            let sessions = self.sessions.lock().unwrap();
            let (snap, start) = sessions.get(&addr)?;
            let timeout = snap.params.sessiontimeout;
            if timeout > 0 && start.elapsed() >= Duration::from_secs(timeout) {
                return None;
            }
            Some(snap.clone())
        }

        fn publish(&self, msg: RedirMsg) -> Result<(), PostError> {
            let mut sessions = self.sessions.lock().unwrap();
            match msg.kind {
                MsgKind::Login => {
                    let snap = SessionSnapshot {
                        authenticated: true,
                        username: Some(msg.username.clone()),
                        params: msg.params,
                        ..Default::default()
                    };
                    sessions.insert(msg.addr, (snap, Instant::now()));
                }
                MsgKind::Logout | MsgKind::Abort => {
                    sessions.remove(&msg.addr);
                }
            }
            self.published.lock().unwrap().push(msg);
            Ok(())
        }
    }

    struct FakeRadius {
        outcome: RadiusOutcome,
        hang: bool,
        requests: Mutex<Vec<RadiusRequest>>,
    }

    impl FakeRadius {
        fn answering(outcome: RadiusOutcome) -> Self {
            FakeRadius {
                outcome,
                hang: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn accepting(sessiontimeout: u64) -> Self {
            Self::answering(RadiusOutcome::Accept(RadiusAccept {
                params: SessionParams {
                    sessiontimeout,
                    ..Default::default()
                },
                ..Default::default()
            }))
        }

        fn hanging() -> Self {
            FakeRadius {
                hang: true,
                ..Self::answering(RadiusOutcome::Timeout)
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RadiusAuthenticator for FakeRadius {
        async fn authenticate(&self, request: RadiusRequest) -> RadiusOutcome {
            self.requests.lock().unwrap().push(request);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.outcome.clone()
        }
    }

    struct Fixture {
        redir: Redir,
        authority: Arc<FakeAuthority>,
        radius: Arc<FakeRadius>,
    }

    fn fixture_with(config: Config, authority: FakeAuthority, radius: FakeRadius) -> Fixture {
        let authority = Arc::new(authority);
        let radius = Arc::new(radius);
        let redir = Redir::new(
            Arc::new(config),
            Arc::new(ChallengeStore::new()),
            authority.clone(),
            radius.clone(),
        );
        Fixture {
            redir,
            authority,
            radius,
        }
    }

    fn fixture(radius: FakeRadius) -> Fixture {
        fixture_with(Config::default(), FakeAuthority::default(), radius)
    }

    async fn exchange(redir: &Redir, peer: Ipv4Addr, target: &str) -> (Outcome, String) {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client
            .write_all(format!("GET {} HTTP/1.1\r\nHost: 10.1.0.1\r\n\r\n", target).as_bytes())
            .await
            .unwrap();
        let outcome = redir.handle(&mut server, peer).await;
        drop(server);
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        (outcome, reply)
    }

    fn location(reply: &str) -> String {
        reply
            .lines()
            .find_map(|l| l.strip_prefix("Location: "))
            .unwrap_or_default()
            .to_string()
    }

    fn query_param(url: &str, key: &str) -> Option<String> {
        let (_, q) = url.split_once('?')?;
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    async fn challenge(redir: &Redir, peer: Ipv4Addr) -> String {
        let (outcome, reply) = exchange(redir, peer, "/challenge").await;
        assert_eq!(outcome.code, Some(ReplyCode::NotYet));
        query_param(&location(&reply), "challenge").expect("challenge in redirect")
    }

    const RESPONSE: &str = "00112233445566778899aabbccddeeff";

    #[tokio::test]
    async fn accepted_login_publishes_once_and_succeeds() {
        let f = fixture(FakeRadius::accepting(3600));
        challenge(&f.redir, CLIENT).await;

        let (outcome, reply) = exchange(
            &f.redir,
            CLIENT,
            &format!("/login?username=bob&response={}&userurl=http%3A%2F%2Fexample.com%2F", RESPONSE),
        )
        .await;

        assert_eq!(outcome.code, Some(ReplyCode::Success));
        assert!(outcome.failures.is_empty());
        assert_eq!(location(&reply), "http://example.com/");
        let published = f.authority.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, MsgKind::Login);
        assert_eq!(published[0].username.as_str(), "bob");
        assert_eq!(published[0].params.sessiontimeout, 3600);
    }

    #[tokio::test]
    async fn login_without_challenge_never_reaches_radius() {
        let f = fixture(FakeRadius::accepting(0));
        let (outcome, _) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(f.radius.calls(), 0);
        assert!(f.authority.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_challenge_never_reaches_radius() {
        let f = fixture(FakeRadius::accepting(0));
        challenge(&f.redir, CLIENT).await;
        tokio::time::advance(Duration::from_secs(301)).await;

        let (outcome, _) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(f.radius.calls(), 0);
    }

    #[tokio::test]
    async fn challenge_of_another_client_is_refused() {
        let f = fixture(FakeRadius::accepting(0));
        let theirs = challenge(&f.redir, OTHER).await;

        let (outcome, _) = exchange(
            &f.redir,
            CLIENT,
            &format!("/login?username=bob&response={}&challenge={}", RESPONSE, theirs),
        )
        .await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));

        // Our own challenge, but the echo names someone else's.
        challenge(&f.redir, CLIENT).await;
        let (outcome, _) = exchange(
            &f.redir,
            CLIENT,
            &format!("/login?username=bob&response={}&challenge={}", RESPONSE, theirs),
        )
        .await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(f.radius.calls(), 0);
    }

    #[tokio::test]
    async fn login_while_authenticated_is_already() {
        let f = fixture(FakeRadius::accepting(0));
        f.authority.authenticate(CLIENT);
        f.redir.challenges().issue(CLIENT).unwrap();

        let (outcome, reply) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::Already));
        assert_eq!(query_param(&location(&reply), "res").as_deref(), Some("already"));
        assert_eq!(f.radius.calls(), 0);
        assert!(f.authority.published().is_empty());
    }

    #[tokio::test]
    async fn logout_while_authenticated_publishes_before_reply() {
        let f = fixture(FakeRadius::accepting(0));
        f.authority.authenticate(CLIENT);

        let (outcome, reply) = exchange(&f.redir, CLIENT, "/logoff").await;
        assert_eq!(outcome.code, Some(ReplyCode::Logoff));
        assert_eq!(query_param(&location(&reply), "res").as_deref(), Some("logoff"));
        let published = f.authority.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, MsgKind::Logout);
    }

    #[tokio::test]
    async fn logout_while_unauthenticated_publishes_nothing() {
        let f = fixture(FakeRadius::accepting(0));
        let (outcome, _) = exchange(&f.redir, CLIENT, "/logout").await;
        assert_eq!(outcome.code, Some(ReplyCode::Logoff));
        assert!(f.authority.published().is_empty());
    }

    #[tokio::test]
    async fn abort_depends_on_authentication() {
        let f = fixture(FakeRadius::accepting(0));
        let (outcome, _) = exchange(&f.redir, CLIENT, "/abort").await;
        assert_eq!(outcome.code, Some(ReplyCode::AbortNak));
        assert!(f.authority.published().is_empty());

        f.authority.authenticate(CLIENT);
        let (outcome, reply) = exchange(&f.redir, CLIENT, "/abortlogin").await;
        assert_eq!(outcome.code, Some(ReplyCode::AbortAck));
        assert_eq!(query_param(&location(&reply), "res").as_deref(), Some("logoff"));
        assert_eq!(f.authority.published()[0].kind, MsgKind::Abort);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_collaborators_still_get_one_reply() {
        let f = fixture_with(Config::default(), FakeAuthority::hanging(), FakeRadius::hanging());
        f.redir.challenges().issue(CLIENT).unwrap();

        let (outcome, reply) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(
            outcome.failures,
            vec![
                (Stage::GetState, StageFailure::TimedOut),
                (Stage::Radius, StageFailure::TimedOut)
            ]
        );
        assert_eq!(reply.matches("HTTP/1.0 302").count(), 1);
        assert_eq!(f.radius.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out_in_get_request() {
        let f = fixture(FakeRadius::accepting(0));
        let (mut client, mut server) = tokio::io::duplex(4096);
        let outcome = f.redir.handle(&mut server, CLIENT).await;
        drop(server);

        assert_eq!(outcome.kind, None);
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(outcome.failures, vec![(Stage::GetRequest, StageFailure::TimedOut)]);
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert!(reply.contains("res=failed"));
        assert_eq!(f.authority.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn challenge_is_good_for_one_login() {
        let f = fixture(FakeRadius::accepting(0));
        let chal = challenge(&f.redir, CLIENT).await;
        let login = format!("/login?username=bob&response={}&challenge={}", RESPONSE, chal);

        let (first, _) = exchange(&f.redir, CLIENT, &login).await;
        assert_eq!(first.code, Some(ReplyCode::Success));
        let (replay, _) = exchange(&f.redir, CLIENT, &login).await;
        assert_eq!(replay.code, Some(ReplyCode::Already));
        assert_eq!(f.radius.calls(), 1);
        assert_eq!(f.authority.published().len(), 1);
    }

    #[tokio::test]
    async fn replayed_challenge_without_session_is_refused() {
        let f = fixture(FakeRadius::answering(RadiusOutcome::Reject { reply: None }));
        let chal = challenge(&f.redir, CLIENT).await;
        let login = format!("/login?username=bob&response={}&challenge={}", RESPONSE, chal);

        let (first, _) = exchange(&f.redir, CLIENT, &login).await;
        assert_eq!(first.code, Some(ReplyCode::FailedReject));
        let (replay, _) = exchange(&f.redir, CLIENT, &login).await;
        assert_eq!(replay.code, Some(ReplyCode::FailedOther));
        assert_eq!(f.radius.calls(), 1);
    }

    #[tokio::test]
    async fn username_bounds_are_checked_before_any_collaborator() {
        let f = fixture(FakeRadius::accepting(0));
        challenge(&f.redir, CLIENT).await;
        let lookups = f.authority.lookups.load(Ordering::SeqCst);

        let long = format!("/login?username={}&response={}", "a".repeat(256), RESPONSE);
        let (outcome, _) = exchange(&f.redir, CLIENT, &long).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(outcome.failures, vec![(Stage::GetRequest, StageFailure::Error)]);
        assert_eq!(f.authority.lookups.load(Ordering::SeqCst), lookups);
        assert_eq!(f.radius.calls(), 0);

        let max = format!("/login?username={}&response={}", "a".repeat(253), RESPONSE);
        let (outcome, _) = exchange(&f.redir, CLIENT, &max).await;
        assert_eq!(outcome.code, Some(ReplyCode::Success));
        assert_eq!(f.radius.requests.lock().unwrap()[0].username.len(), 253);
    }

    #[tokio::test]
    async fn username_too_long_for_radius_is_refused_locally() {
        let f = fixture(FakeRadius::accepting(0));
        challenge(&f.redir, CLIENT).await;

        let login = format!("/login?username={}&response={}", "a".repeat(254), RESPONSE);
        let (outcome, _) = exchange(&f.redir, CLIENT, &login).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert!(outcome.failures.is_empty());
        assert_eq!(f.radius.calls(), 0);
        assert!(f.authority.published().is_empty());
    }

    #[tokio::test]
    async fn userurl_bounds_are_checked_before_any_collaborator() {
        let f = fixture(FakeRadius::accepting(0));
        challenge(&f.redir, CLIENT).await;
        let lookups = f.authority.lookups.load(Ordering::SeqCst);
        let prefix = "http://example.com/";
        let userurl = |len: usize| {
            let url = format!("{}{}", prefix, "a".repeat(len - prefix.len()));
            url::form_urlencoded::byte_serialize(url.as_bytes()).collect::<String>()
        };

        let long = format!("/login?username=bob&response={}&userurl={}", RESPONSE, userurl(256));
        let (outcome, _) = exchange(&f.redir, CLIENT, &long).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(outcome.failures, vec![(Stage::GetRequest, StageFailure::Error)]);
        assert_eq!(f.authority.lookups.load(Ordering::SeqCst), lookups);
        assert_eq!(f.radius.calls(), 0);

        let max = format!("/login?username=bob&response={}&userurl={}", RESPONSE, userurl(255));
        let (outcome, reply) = exchange(&f.redir, CLIENT, &max).await;
        assert_eq!(outcome.code, Some(ReplyCode::Success));
        assert_eq!(location(&reply).len(), 255);
        assert!(location(&reply).starts_with(prefix));
    }

    #[tokio::test]
    async fn userurl_cannot_smuggle_response_headers() {
        let f = fixture(FakeRadius::accepting(0));
        challenge(&f.redir, CLIENT).await;

        let (outcome, reply) = exchange(
            &f.redir,
            CLIENT,
            &format!(
                "/login?username=bob&response={}&userurl=http%3A%2F%2Fx%2F%0D%0ASet-Cookie%3A%20session%3D1",
                RESPONSE
            ),
        )
        .await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(outcome.failures, vec![(Stage::GetRequest, StageFailure::Error)]);
        assert_eq!(f.radius.calls(), 0);
        let (head, _) = reply.split_once("\r\n\r\n").unwrap();
        assert!(!head.lines().any(|l| l.starts_with("Set-Cookie")));
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_login_then_expiry_for_one_client() {
        let mut config = Config::default();
        config.uamsecret = Some("secret".to_string());
        let f = fixture_with(config, FakeAuthority::default(), FakeRadius::accepting(3600));

        let c1 = challenge(&f.redir, CLIENT).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let (outcome, _) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::Success));
        let published = f.authority.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].params.sessiontimeout, 3600);
        assert_eq!(hex::encode(published[0].uamchal), c1);

        tokio::time::advance(Duration::from_secs(3690)).await;
        let (outcome, reply) = exchange(&f.redir, CLIENT, "/prelogin").await;
        assert_eq!(outcome.code, Some(ReplyCode::NotYet));
        assert_eq!(query_param(&location(&reply), "res").as_deref(), Some("notyet"));
    }

    #[tokio::test]
    async fn secret_hashes_challenge_and_unmasks_password() {
        let mut config = Config::default();
        config.uamsecret = Some("secret".to_string());
        let f = fixture_with(config, FakeAuthority::default(), FakeRadius::accepting(0));

        let chal: [u8; 16] = hex::decode(challenge(&f.redir, CLIENT).await)
            .unwrap()
            .try_into()
            .unwrap();
        let mut ctx = md5::Context::new();
        ctx.consume(chal);
        ctx.consume(b"secret");
        let key = ctx.compute().0;

        let masked: Vec<u8> = b"hunter2\0\0"
            .iter()
            .zip(key.iter().cycle())
            .map(|(p, k)| p ^ k)
            .collect();
        let (outcome, _) = exchange(
            &f.redir,
            CLIENT,
            &format!("/login?username=bob&password={}", hex::encode(masked)),
        )
        .await;
        assert_eq!(outcome.code, Some(ReplyCode::Success));
        assert_eq!(
            f.radius.requests.lock().unwrap()[0].credential,
            RadiusCredential::Pap(b"hunter2".to_vec())
        );

        // Same client, CHAP this time: RADIUS sees the hashed challenge.
        let f = fixture_with(
            Config {
                uamsecret: Some("secret".to_string()),
                ..Default::default()
            },
            FakeAuthority::default(),
            FakeRadius::accepting(0),
        );
        let chal: [u8; 16] = hex::decode(challenge(&f.redir, CLIENT).await)
            .unwrap()
            .try_into()
            .unwrap();
        let mut ctx = md5::Context::new();
        ctx.consume(chal);
        ctx.consume(b"secret");
        exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        let requests = f.radius.requests.lock().unwrap();
        match &requests[0].credential {
            RadiusCredential::Chap { challenge, response } => {
                assert_eq!(*challenge, ctx.compute().0);
                assert_eq!(hex::encode(response), RESPONSE);
            }
            other => panic!("expected CHAP, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reject_carries_reply_and_a_new_challenge() {
        let f = fixture(FakeRadius::answering(RadiusOutcome::Reject {
            reply: Some(AttrString::new("reply", "Wrong password").unwrap()),
        }));
        let first = challenge(&f.redir, CLIENT).await;

        let (outcome, reply) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedReject));
        let url = location(&reply);
        assert_eq!(query_param(&url, "res").as_deref(), Some("failed"));
        assert_eq!(query_param(&url, "reply").as_deref(), Some("Wrong password"));
        let next = query_param(&url, "challenge").unwrap();
        assert_ne!(next, first);
        assert!(f.authority.published().is_empty());
    }

    #[tokio::test]
    async fn radius_timeout_is_failed_other() {
        let f = fixture(FakeRadius::answering(RadiusOutcome::Timeout));
        challenge(&f.redir, CLIENT).await;
        let (outcome, _) =
            exchange(&f.redir, CLIENT, &format!("/login?username=bob&response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn login_needs_username_and_credential() {
        let f = fixture(FakeRadius::accepting(0));
        challenge(&f.redir, CLIENT).await;
        let (outcome, _) = exchange(&f.redir, CLIENT, "/login?username=bob").await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        let (outcome, _) = exchange(&f.redir, CLIENT, &format!("/login?response={}", RESPONSE)).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(f.radius.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_paths_are_prelogin() {
        let f = fixture(FakeRadius::accepting(0));
        let (outcome, reply) = exchange(&f.redir, CLIENT, "/generate_204").await;
        assert_eq!(outcome.kind, Some(RequestKind::Prelogin));
        assert_eq!(outcome.code, Some(ReplyCode::NotYet));
        assert!(query_param(&location(&reply), "challenge").is_some());

        f.authority.authenticate(CLIENT);
        let (outcome, _) = exchange(&f.redir, CLIENT, "/admin").await;
        assert_eq!(outcome.code, Some(ReplyCode::Already));
    }

    #[tokio::test]
    async fn non_get_is_failed_other() {
        let f = fixture(FakeRadius::accepting(0));
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"POST /login HTTP/1.1\r\n\r\n").await.unwrap();
        let outcome = f.redir.handle(&mut server, CLIENT).await;
        assert_eq!(outcome.code, Some(ReplyCode::FailedOther));
        assert_eq!(outcome.failures, vec![(Stage::GetRequest, StageFailure::Error)]);
    }

    #[tokio::test]
    async fn content_replies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("portal.css"), "body{}").unwrap();
        let config = Config {
            wwwdir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let f = fixture_with(config, FakeAuthority::default(), FakeRadius::accepting(0));

        let (outcome, reply) = exchange(&f.redir, CLIENT, "/www/portal.css").await;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.code, None);
        assert!(reply.contains("Content-Type: text/css"));
        assert!(reply.ends_with("body{}"));

        let (outcome, _) = exchange(&f.redir, CLIENT, "/www/missing.css").await;
        assert_eq!(outcome.status, 404);

        let (outcome, reply) = exchange(&f.redir, CLIENT, "/about").await;
        assert_eq!(outcome.status, 200);
        assert!(reply.contains("CoovaChilli"));

        let (outcome, reply) = exchange(&f.redir, CLIENT, "/msdownload").await;
        assert_eq!(outcome.status, 200);
        assert!(reply.contains("res=notyet"));
    }
}
