/*++
Licensed under the Apache-2.0 license.

Abstract:
    Blocking ACME (RFC 8555) client: directory discovery, nonce tracking,
    JWS-signed requests and the account, order, authorization and challenge
    resources needed for device attestation.
--*/

pub use types::{
    Account, Authorization, Challenge, Directory, DirectoryMeta, Identifier, Order, Problem,
    Status, BAD_NONCE, DEVICE_ATTEST_01, PERMANENT_IDENTIFIER,
};

mod types;

use crypto::{base64url, jws, AccountKey, CryptoError, JwsKeyId};
use log::debug;
use reqwest::{
    blocking::{Client, Response},
    header::{HeaderMap, ACCEPT, CONTENT_TYPE, LOCATION, RETRY_AFTER},
    StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{thread, time::Duration};

const REPLAY_NONCE: &str = "Replay-Nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CERTIFICATE_CHAIN: &str = "application/pem-certificate-chain";
const USER_AGENT: &str = concat!("attest-client/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug)]
pub enum AcmeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("CA returned {kind}: {detail}")]
    Problem { kind: String, detail: String },
    #[error("account already exists")]
    AccountAlreadyExists,
    #[error("terms of service at {0} were not accepted")]
    TermsNotAccepted(String),
    #[error("malformed CA response: {0}")]
    Malformed(String),
    #[error("request signing failed: {0}")]
    Signing(#[from] CryptoError),
    #[error("no account registered")]
    NoAccount,
    #[error("order {url} is invalid: {reason}")]
    OrderInvalid { url: String, reason: String },
    #[error("{url} still {status:?} after {attempts} polls")]
    Timeout {
        url: String,
        status: Status,
        attempts: u32,
    },
}

impl From<Problem> for AcmeError {
    fn from(problem: Problem) -> Self {
        AcmeError::Problem {
            kind: problem.kind,
            detail: problem.detail,
        }
    }
}

/// A session with one ACME CA on behalf of one account key.
pub struct AcmeClient {
    http: Client,
    directory: Directory,
    key: AccountKey,
    account_url: Option<String>,
    nonce: Option<String>,
}

impl AcmeClient {
    /// Fetches the directory at `directory_url`.
    ///
    /// # Arguments
    ///
    /// * `directory_url` - ACME directory endpoint.
    /// * `key` - Account key every request is signed with.
    /// * `timeout` - Bound on each HTTP exchange.
    pub fn connect(
        directory_url: &str,
        key: AccountKey,
        timeout: Duration,
    ) -> Result<AcmeClient, AcmeError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let directory: Directory = parse_json(check(http.get(directory_url).send()?)?)?;
        debug!("Directory {directory_url}: {directory:?}");
        Ok(AcmeClient {
            http,
            directory,
            key,
            account_url: None,
            nonce: None,
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn account_key(&self) -> &AccountKey {
        &self.key
    }

    pub fn account_url(&self) -> Option<&str> {
        self.account_url.as_deref()
    }

    /// Registers the account key with the CA.
    ///
    /// Returns `AccountAlreadyExists` when the CA already knew the key. The
    /// account URL is recorded in both cases, so later requests work either
    /// way.
    pub fn register(&mut self, accept_terms: bool) -> Result<Account, AcmeError> {
        if let Some(terms) = &self.directory.meta.terms_of_service {
            if !accept_terms {
                return Err(AcmeError::TermsNotAccepted(terms.clone()));
            }
        }
        let url = self.directory.new_account.clone();
        let response = self.post(&url, Some(&json!({ "termsOfServiceAgreed": accept_terms })))?;
        let existing = response.status() == StatusCode::OK;
        let location = location(&response)?;
        let mut account: Account = parse_json(response)?;
        account.url = location.clone();
        self.account_url = Some(location);
        if existing {
            return Err(AcmeError::AccountAlreadyExists);
        }
        Ok(account)
    }

    pub fn new_order(&mut self, identifiers: &[Identifier]) -> Result<Order, AcmeError> {
        self.require_account()?;
        let url = self.directory.new_order.clone();
        let response = self.post(&url, Some(&json!({ "identifiers": identifiers })))?;
        let location = location(&response)?;
        let mut order: Order = parse_json(response)?;
        order.url = location;
        Ok(order)
    }

    pub fn authorization(&mut self, url: &str) -> Result<Authorization, AcmeError> {
        self.require_account()?;
        parse_json(self.post(url, None)?)
    }

    /// Responds to `challenge` with `payload` and returns the challenge as
    /// the CA reports it afterwards.
    pub fn accept_challenge(
        &mut self,
        challenge: &Challenge,
        payload: &Value,
    ) -> Result<Challenge, AcmeError> {
        self.require_account()?;
        parse_json(self.post(&challenge.url, Some(payload))?)
    }

    /// Polls the order at `url` until it reaches `until`.
    ///
    /// Waits `Retry-After` seconds between polls when the CA sends it, at
    /// most a minute, and `interval` otherwise. An `invalid` order ends the
    /// wait at once.
    pub fn poll_order(
        &mut self,
        url: &str,
        until: Status,
        interval: Duration,
        attempts: u32,
    ) -> Result<Order, AcmeError> {
        self.require_account()?;
        let mut status = Status::Pending;
        for attempt in 1..=attempts {
            let response = self.post(url, None)?;
            let delay = poll_delay(response.headers(), interval);
            let mut order: Order = parse_json(response)?;
            order.url = url.to_string();
            status = order.status;
            if status == until {
                return Ok(order);
            }
            if status == Status::Invalid {
                return Err(AcmeError::OrderInvalid {
                    url: order.url,
                    reason: order
                        .error
                        .map(|problem| problem.to_string())
                        .unwrap_or_else(|| "no error reported".to_string()),
                });
            }
            debug!("Order {url} is {status:?}, poll {attempt}/{attempts}");
            if attempt < attempts {
                thread::sleep(delay);
            }
        }
        Err(AcmeError::Timeout {
            url: url.to_string(),
            status,
            attempts,
        })
    }

    /// Submits a DER certificate request to the order's finalize URL.
    pub fn finalize(&mut self, order: &Order, csr: &[u8]) -> Result<Order, AcmeError> {
        self.require_account()?;
        let response = self.post(&order.finalize, Some(&json!({ "csr": base64url(csr) })))?;
        let mut finalized: Order = parse_json(response)?;
        finalized.url = order.url.clone();
        Ok(finalized)
    }

    /// Downloads a PEM certificate chain and returns its DER certificates,
    /// leaf first.
    pub fn certificate_chain(&mut self, url: &str) -> Result<Vec<Vec<u8>>, AcmeError> {
        self.require_account()?;
        let body = self
            .post_accepting(url, None, Some(PEM_CERTIFICATE_CHAIN))?
            .text()?;
        let certificates = pem::parse_many(&body)
            .map_err(|e| AcmeError::Malformed(e.to_string()))?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.contents().to_vec())
            .collect::<Vec<_>>();
        if certificates.is_empty() {
            return Err(AcmeError::Malformed(format!("no certificates at {url}")));
        }
        Ok(certificates)
    }

    fn require_account(&self) -> Result<(), AcmeError> {
        self.account_url
            .as_ref()
            .map(|_| ())
            .ok_or(AcmeError::NoAccount)
    }

    fn post(&mut self, url: &str, payload: Option<&Value>) -> Result<Response, AcmeError> {
        self.post_accepting(url, payload, None)
    }

    /// Sends a signed POST, retrying once with a fresh nonce if the CA
    /// rejects the one used.
    fn post_accepting(
        &mut self,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response, AcmeError> {
        match self.post_once(url, payload, accept) {
            Err(AcmeError::Problem { kind, .. }) if kind == BAD_NONCE => {
                debug!("Nonce rejected by {url}, retrying");
                self.post_once(url, payload, accept)
            }
            result => result,
        }
    }

    fn post_once(
        &mut self,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> Result<Response, AcmeError> {
        let nonce = self.nonce()?;
        let key_id = match &self.account_url {
            Some(kid) if url != self.directory.new_account => JwsKeyId::Kid(kid),
            _ => JwsKeyId::Jwk,
        };
        let body = jws::sign(&self.key, key_id, &nonce, url, payload)?;

        let mut request = self.http.post(url).header(CONTENT_TYPE, JOSE_JSON);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        let response = request.json(&body).send()?;
        debug!("POST {url} -> {}", response.status());
        if let Some(nonce) = replay_nonce(response.headers()) {
            self.nonce = Some(nonce);
        }
        check(response)
    }

    fn nonce(&mut self) -> Result<String, AcmeError> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }
        let response = check(self.http.head(&self.directory.new_nonce).send()?)?;
        replay_nonce(response.headers())
            .ok_or_else(|| AcmeError::Malformed("newNonce sent no Replay-Nonce".into()))
    }
}

/// Turns a non-success response into an error, preferring the CA's problem
/// document.
fn check(response: Response) -> Result<Response, AcmeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(match serde_json::from_str::<Problem>(&body) {
        Ok(problem) if !problem.kind.is_empty() => problem.into(),
        _ => AcmeError::Problem {
            kind: format!("HTTP {status}"),
            detail: body,
        },
    })
}

fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, AcmeError> {
    let body = response.bytes()?;
    serde_json::from_slice(&body).map_err(|e| AcmeError::Malformed(e.to_string()))
}

fn location(response: &Response) -> Result<String, AcmeError> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AcmeError::Malformed(format!("{} sent no Location", response.url())))
}

fn replay_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Longest wait a `Retry-After` header can impose between polls.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// The CA's `Retry-After` bounded by [`MAX_RETRY_AFTER`], or `interval`
/// without one.
fn poll_delay(headers: &HeaderMap, interval: Duration) -> Duration {
    retry_after(headers).map_or(interval, |delay| delay.min(MAX_RETRY_AFTER))
}

/// Only the delay-seconds form is understood.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}
