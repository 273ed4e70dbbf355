// Licensed under the Apache-2.0 license

//! In-memory ACME CA speaking just enough RFC 8555 for one device-attest-01
//! issuance.

#![allow(dead_code)]

use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use crypto::SignedRequest;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tiny_http::{Header, Method, Request, Response, Server};

const TOKEN: &str = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA";
pub const LEAF_DER: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x01];
pub const ROOT_DER: &[u8] = &[0x30, 0x03, 0x02, 0x01, 0x02];

const ACCOUNT: &str = "/account/1";
const ORDER: &str = "/order/1";

#[derive(Debug, Clone)]
pub struct Options {
    /// Authorizations attached to each order.
    pub authorizations: usize,
    pub terms_of_service: Option<String>,
    /// Answer the first signed request with `badNonce`.
    pub reject_first_nonce: bool,
    /// Mark the challenge invalid instead of accepting the statement.
    pub reject_attestation: bool,
    /// Like `reject_attestation` but without a problem document.
    pub silent_rejection: bool,
    /// Report the order as `processing` this many times after finalize.
    pub processing_polls: u32,
    /// Leading authorizations that start out valid.
    pub valid_authorizations: usize,
    /// List a device-attest-01 challenge next to http-01.
    pub offer_attestation: bool,
    /// Hand out challenges without a token.
    pub empty_token: bool,
    /// Keep the order pending after every authorization is valid.
    pub never_ready: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            authorizations: 1,
            terms_of_service: None,
            reject_first_nonce: false,
            reject_attestation: false,
            silent_rejection: false,
            processing_polls: 0,
            valid_authorizations: 0,
            offer_attestation: true,
            empty_token: false,
            never_ready: false,
        }
    }
}

/// One request as the CA saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logged {
    pub method: String,
    pub path: String,
    /// `"jwk"` or `"kid"` for signed requests.
    pub key_id: Option<&'static str>,
    pub payload: Option<Value>,
}

#[derive(Default)]
pub struct State {
    pub requests: Vec<Logged>,
    pub account_jwk: Option<Value>,
    pub orders_created: usize,
    /// Decoded statements in submission order.
    pub attestations: Vec<Vec<u8>>,
    pub csr: Option<Vec<u8>>,
    nonces: HashSet<String>,
    next_nonce: u64,
    nonce_rejected: bool,
    authz_valid: Vec<bool>,
    challenge_invalid: bool,
    finalized: bool,
    processing_left: u32,
}

pub struct MockCa {
    base: String,
    options: Options,
    state: Arc<Mutex<State>>,
    server: Arc<Server>,
    worker: Option<JoinHandle<()>>,
}

impl MockCa {
    pub fn start(options: Options) -> MockCa {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let base = format!("http://{addr}");
        let state = Arc::new(Mutex::new(State::default()));

        let worker = {
            let server = server.clone();
            let handler = Handler {
                base: base.clone(),
                options: options.clone(),
                state: state.clone(),
            };
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    handler.handle(request);
                }
            })
        };
        MockCa {
            base,
            options,
            state,
            server,
            worker: Some(worker),
        }
    }

    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.base)
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state()
            .requests
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

impl Drop for MockCa {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Handler {
    base: String,
    options: Options,
    state: Arc<Mutex<State>>,
}

type Reply = Response<std::io::Cursor<Vec<u8>>>;

impl Handler {
    fn handle(&self, mut request: Request) {
        let mut body = Vec::new();
        let _ = request.as_reader().read_to_end(&mut body);
        let method = request.method().clone();
        let path = request.url().to_string();
        let reply = self.route(&method, &path, &body);
        let _ = request.respond(reply);
    }

    fn route(&self, method: &Method, path: &str, body: &[u8]) -> Reply {
        let mut state = self.state.lock().unwrap();
        let nonce = self.fresh_nonce(&mut state);

        let reply = match method {
            Method::Get if path == "/directory" => {
                state.requests.push(logged("GET", path, None, None));
                json_reply(200, &self.directory())
            }
            Method::Head if path == "/nonce" => {
                state.requests.push(logged("HEAD", path, None, None));
                Response::from_data(Vec::new())
            }
            Method::Post => match self.verify(&mut state, path, body) {
                Ok(payload) => self.post(&mut state, path, payload),
                Err(reply) => reply,
            },
            _ => problem(404, "urn:ietf:params:acme:error:malformed", "no such resource"),
        };
        reply.with_header(header("Replay-Nonce", &nonce))
    }

    fn directory(&self) -> Value {
        let mut directory = json!({
            "newNonce": format!("{}/nonce", self.base),
            "newAccount": format!("{}/account", self.base),
            "newOrder": format!("{}/order", self.base),
        });
        if let Some(terms) = &self.options.terms_of_service {
            directory["meta"] = json!({ "termsOfService": terms });
        }
        directory
    }

    fn fresh_nonce(&self, state: &mut State) -> String {
        state.next_nonce += 1;
        let nonce = format!("nonce-{}", state.next_nonce);
        state.nonces.insert(nonce.clone());
        nonce
    }

    /// Checks the JWS envelope and returns the decoded payload, `None` for
    /// POST-as-GET.
    fn verify(&self, state: &mut State, path: &str, body: &[u8]) -> Result<Option<Value>, Reply> {
        let malformed = |detail: &str| problem(400, "urn:ietf:params:acme:error:malformed", detail);
        let jws: SignedRequest =
            serde_json::from_slice(body).map_err(|_| malformed("body is not a JWS"))?;
        let protected = Base64UrlUnpadded::decode_vec(&jws.protected)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .ok_or_else(|| malformed("bad protected header"))?;

        let nonce = protected["nonce"].as_str().unwrap_or_default();
        if !state.nonces.remove(nonce) {
            return Err(problem(400, "urn:ietf:params:acme:error:badNonce", "unknown nonce"));
        }
        if self.options.reject_first_nonce && !state.nonce_rejected {
            state.nonce_rejected = true;
            return Err(problem(400, "urn:ietf:params:acme:error:badNonce", "stale nonce"));
        }
        if protected["url"].as_str() != Some(format!("{}{path}", self.base).as_str()) {
            return Err(malformed("url does not match the request"));
        }

        let key_id = if path == "/account" {
            if protected.get("jwk").is_none() {
                return Err(malformed("newAccount needs a jwk"));
            }
            state.account_jwk.get_or_insert(protected["jwk"].clone());
            "jwk"
        } else {
            if protected["kid"].as_str() != Some(format!("{}{ACCOUNT}", self.base).as_str()) {
                return Err(problem(
                    401,
                    "urn:ietf:params:acme:error:accountDoesNotExist",
                    "unknown kid",
                ));
            }
            "kid"
        };

        let payload = if jws.payload.is_empty() {
            None
        } else {
            let bytes = Base64UrlUnpadded::decode_vec(&jws.payload)
                .map_err(|_| malformed("payload is not base64url"))?;
            Some(serde_json::from_slice(&bytes).map_err(|_| malformed("payload is not JSON"))?)
        };
        state
            .requests
            .push(logged("POST", path, Some(key_id), payload.clone()));
        Ok(payload)
    }

    fn post(&self, state: &mut State, path: &str, payload: Option<Value>) -> Reply {
        let location = |path: &str| header("Location", &format!("{}{path}", self.base));
        match path {
            "/account" => {
                let existing = state
                    .requests
                    .iter()
                    .filter(|r| r.path == "/account")
                    .count()
                    > 1;
                json_reply(if existing { 200 } else { 201 }, &json!({ "status": "valid" }))
                    .with_header(location(ACCOUNT))
            }
            "/order" => {
                state.orders_created += 1;
                state.authz_valid = (0..self.options.authorizations)
                    .map(|i| i < self.options.valid_authorizations)
                    .collect();
                state.challenge_invalid = false;
                state.finalized = false;
                json_reply(201, &self.order(state)).with_header(location(ORDER))
            }
            ORDER => {
                if state.finalized && state.processing_left > 0 {
                    state.processing_left -= 1;
                    return json_reply(200, &self.order(state)).with_header(header("Retry-After", "0"));
                }
                json_reply(200, &self.order(state))
            }
            "/order/1/finalize" => {
                let csr = payload
                    .as_ref()
                    .and_then(|p| p["csr"].as_str())
                    .and_then(|csr| Base64UrlUnpadded::decode_vec(csr).ok());
                let Some(csr) = csr else {
                    return problem(400, "urn:ietf:params:acme:error:badCSR", "missing csr");
                };
                state.csr = Some(csr);
                state.finalized = true;
                state.processing_left = self.options.processing_polls;
                json_reply(200, &self.order(state))
            }
            "/cert/1" => {
                let chain = [LEAF_DER, ROOT_DER]
                    .iter()
                    .map(|der| {
                        pem::encode_config(
                            &pem::Pem::new("CERTIFICATE", *der),
                            pem::EncodeConfig {
                                line_ending: pem::LineEnding::LF,
                            },
                        )
                    })
                    .collect::<String>();
                Response::from_data(chain.into_bytes())
                    .with_header(header("Content-Type", "application/pem-certificate-chain"))
            }
            _ => self.authz_or_challenge(state, path, payload),
        }
    }

    fn authz_or_challenge(&self, state: &mut State, path: &str, payload: Option<Value>) -> Reply {
        let index = |prefix: &str| {
            path.strip_prefix(prefix)
                .and_then(|i| i.parse::<usize>().ok())
                .filter(|&i| i < state.authz_valid.len())
        };
        if let Some(i) = index("/authz/") {
            return json_reply(200, &self.authorization(state, i));
        }
        let Some(i) = index("/challenge/") else {
            return problem(404, "urn:ietf:params:acme:error:malformed", "no such resource");
        };

        let statement = payload
            .as_ref()
            .and_then(|p| p["attStmt"].as_str())
            .and_then(|s| Base64::decode_vec(s).ok());
        let Some(statement) = statement else {
            return problem(400, "urn:ietf:params:acme:error:malformed", "missing attStmt");
        };
        state.attestations.push(statement);
        if self.options.reject_attestation || self.options.silent_rejection {
            state.challenge_invalid = true;
        } else {
            state.authz_valid[i] = true;
        }
        json_reply(200, &self.challenge(state, i))
    }

    fn order(&self, state: &State) -> Value {
        let authorized = !state.authz_valid.is_empty() && state.authz_valid.iter().all(|v| *v);
        let status = match (state.finalized, state.processing_left, authorized) {
            (true, 0, _) => "valid",
            (true, _, _) => "processing",
            (false, _, true) if !self.options.never_ready => "ready",
            (false, _, false) if state.challenge_invalid => "invalid",
            _ => "pending",
        };
        let mut order = json!({
            "status": status,
            "identifiers": [{ "type": "permanent-identifier", "value": "12345" }],
            "authorizations": (0..state.authz_valid.len())
                .map(|i| format!("{}/authz/{i}", self.base))
                .collect::<Vec<_>>(),
            "finalize": format!("{}/order/1/finalize", self.base),
        });
        if status == "valid" {
            order["certificate"] = json!(format!("{}/cert/1", self.base));
        }
        order
    }

    fn authorization(&self, state: &State, i: usize) -> Value {
        let mut challenges = vec![json!({
            "type": "http-01",
            "url": format!("{}/http/{i}", self.base),
            "status": "pending",
            "token": "unused",
        })];
        if self.options.offer_attestation {
            challenges.push(self.challenge(state, i));
        }
        json!({
            "status": if state.authz_valid[i] { "valid" } else { "pending" },
            "identifier": { "type": "permanent-identifier", "value": "12345" },
            "challenges": challenges,
        })
    }

    fn challenge(&self, state: &State, i: usize) -> Value {
        let mut challenge = json!({
            "type": "device-attest-01",
            "url": format!("{}/challenge/{i}", self.base),
            "status": if state.authz_valid[i] { "valid" } else { "pending" },
            "token": if self.options.empty_token { String::new() } else { token(i) },
        });
        if state.challenge_invalid {
            challenge["status"] = json!("invalid");
        }
        if state.challenge_invalid && !self.options.silent_rejection {
            challenge["error"] = json!({
                "type": "urn:ietf:params:acme:error:badAttestationStatement",
                "detail": "attestation rejected",
            });
        }
        challenge
    }
}

fn logged(method: &str, path: &str, key_id: Option<&'static str>, payload: Option<Value>) -> Logged {
    Logged {
        method: method.to_string(),
        path: path.to_string(),
        key_id,
        payload,
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap()
}

fn json_reply(status: u16, body: &Value) -> Reply {
    Response::from_data(body.to_string().into_bytes())
        .with_status_code(status)
        .with_header(header("Content-Type", "application/json"))
}

fn problem(status: u16, kind: &str, detail: &str) -> Reply {
    Response::from_data(json!({ "type": kind, "detail": detail }).to_string().into_bytes())
        .with_status_code(status)
        .with_header(header("Content-Type", "application/problem+json"))
}

/// Token of the device-attest-01 challenge of authorization `i`.
pub fn token(i: usize) -> String {
    format!("{TOKEN}-{i}")
}
