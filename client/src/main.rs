// Licensed under the Apache-2.0 license

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use client::{
    IssuanceConfig, Issuer, KeyAlgorithm, ModuleConfig, DEFAULT_ACCOUNT_KEY_PATH,
    DEFAULT_CA_ENDPOINT, DEFAULT_DEVICE_SERIAL,
};
use log::error;
use platform::DEFAULT_DEVICE_PATH;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::time::Duration;
use tpm::AkAlgorithm;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KeyArg {
    P256,
    P384,
    Rsa2048,
}

impl From<KeyArg> for KeyAlgorithm {
    fn from(arg: KeyArg) -> Self {
        match arg {
            KeyArg::P256 => KeyAlgorithm::EcdsaP256,
            KeyArg::P384 => KeyAlgorithm::EcdsaP384,
            KeyArg::Rsa2048 => KeyAlgorithm::Rsa2048,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AkArg {
    Rsa2048,
    P256,
}

impl From<AkArg> for AkAlgorithm {
    fn from(arg: AkArg) -> Self {
        match arg {
            AkArg::Rsa2048 => AkAlgorithm::Rsa2048,
            AkArg::P256 => AkAlgorithm::EccP256,
        }
    }
}

/// Requests a certificate for a TPM-resident key by answering an ACME
/// device-attest-01 challenge.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ACME directory URL of the CA.
    #[arg(long, default_value = DEFAULT_CA_ENDPOINT, value_parser = parse_url)]
    ca_address: String,

    /// Device serial number placed in the permanent identifier.
    #[arg(long, default_value = DEFAULT_DEVICE_SERIAL)]
    serial: String,

    /// Use the TPM simulator instead of the platform TPM.
    #[arg(long)]
    sim: bool,

    /// Reach the simulator over this socket instead of running it in process.
    #[arg(long, requires = "sim")]
    sim_socket: Option<PathBuf>,

    /// TPM resource manager device.
    #[arg(long, default_value = DEFAULT_DEVICE_PATH)]
    tpm_device: PathBuf,

    /// PKCS#8 account key, created on first use.
    #[arg(long, default_value = DEFAULT_ACCOUNT_KEY_PATH)]
    account_key: PathBuf,

    /// Algorithm of the certified key.
    #[arg(long, value_enum, default_value_t = KeyArg::P256)]
    key_algorithm: KeyArg,

    /// Algorithm of the attestation key.
    #[arg(long, value_enum, default_value_t = AkArg::Rsa2048)]
    ak_algorithm: AkArg,

    /// Refuse to register when the CA publishes terms of service.
    #[arg(long)]
    reject_tos: bool,

    /// Timeout for each request to the CA, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Order polls before giving up.
    #[arg(long, default_value_t = 10)]
    poll_attempts: u32,
}

fn parse_url(s: &str) -> Result<String, String> {
    reqwest::Url::parse(s)
        .map(|url| url.to_string())
        .map_err(|e| format!("{s}: {e}"))
}

impl Args {
    fn config(&self) -> IssuanceConfig {
        IssuanceConfig {
            ca_endpoint: self.ca_address.clone(),
            device_serial: self.serial.clone(),
            use_simulator: self.sim,
            account_key_path: self.account_key.clone(),
            module: ModuleConfig {
                device_path: self.tpm_device.clone(),
                simulator_socket: self.sim_socket.clone(),
                ak_algorithm: self.ak_algorithm.into(),
            },
            key_algorithm: self.key_algorithm.into(),
            accept_terms_of_service: !self.reject_tos,
            request_timeout: Duration::from_secs(self.timeout_secs),
            poll_attempts: self.poll_attempts,
            ..IssuanceConfig::default()
        }
    }
}

/// Cloud Shell exposes the resource manager to root only.
fn open_device_permissions(device: &Path) -> Result<()> {
    let output = Command::new("sudo")
        .arg("chmod")
        .arg("777")
        .arg(device)
        .output()
        .context("running sudo chmod")?;
    if !output.status.success() {
        bail!(
            "chmod {} failed: {}{}",
            device.display(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

fn run(args: &Args) -> Result<String> {
    if !args.sim && std::env::var("CLOUD_SHELL").as_deref() == Ok("true") {
        open_device_permissions(&args.tpm_device)?;
    }
    let chain = Issuer::new(args.config()).run()?;
    Ok(chain.leaf_pem())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(pem) => print!("{pem}"),
        Err(e) => {
            error!("{e:#}");
            process::exit(1);
        }
    }
}
