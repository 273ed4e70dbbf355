// Licensed under the Apache-2.0 license

use clap::Parser;
use platform::{read_frame, DEFAULT_SOCKET_PATH};
use simulator::Simulator;
use std::fs;
use std::io::{Error, ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process;
use tpm::commands::Command;

fn handle_request(sim: &mut Simulator, stream: &mut UnixStream, cmd: &[u8]) -> std::io::Result<()> {
    println!("----------------------------------");
    match Command::deserialize(cmd) {
        Ok(command) => println!("| Client requested {:#05x}", u32::from(&command)),
        Err(_) => println!("| Client requested invalid command. {cmd:02x?}"),
    }
    println!("|");

    let response = sim.execute(cmd);

    let response_code = response
        .get(6..10)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or_default();
    println!("| Response Code {response_code:#06x}");
    println!("----------------------------------");

    stream.write_all(&response)
}

/// Serves one client until it disconnects, then drops whatever it left
/// loaded.
fn handle_connection(sim: &mut Simulator, mut stream: UnixStream) {
    loop {
        match read_frame(&mut stream) {
            Ok(Some(cmd)) => {
                if let Err(err) = handle_request(sim, &mut stream, &cmd) {
                    println!("Failed to respond: {err}");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                println!("Dropping client: {err}");
                break;
            }
        }
    }
    if sim.loaded_objects() > 0 {
        log::info!("Flushing {} objects left by client", sim.loaded_objects());
    }
    sim.flush_all();
}

fn cleanup(socket: &Path) {
    match fs::remove_file(socket) {
        Ok(_) => {
            println!();
        }
        Err(_) => {
            println!("Warning: Unable to unlink {}", socket.display());
        }
    }
}

/// Starts a TPM simulator that will receive commands and send responses over unix streams.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket to listen on.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Derives every seed and key from this value instead of the OS RNG.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let socket = args.socket.clone();
    // Delete old socket if necessary
    if socket.exists() {
        cleanup(&socket);
    }

    let listener = UnixListener::bind(&socket)?;

    let handler_socket = socket.clone();
    ctrlc::set_handler(move || {
        cleanup(&handler_socket);
        process::exit(0);
    })
    .map_err(|err| Error::new(ErrorKind::Other, format!("{err} while installing handler")))?;

    let mut sim = match args.seed {
        Some(seed) => Simulator::from_seed(seed),
        None => Simulator::new(),
    };

    println!("TPM simulator listening to socket {}", socket.display());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => handle_connection(&mut sim, stream),
            Err(err) => {
                println!("Failed to open socket: {err}");
                cleanup(&socket);
                break;
            }
        }
    }

    Ok(())
}
