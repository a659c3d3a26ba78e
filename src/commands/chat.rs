use std::error::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use indicatif::ProgressBar;
use log::{debug, warn};

use crate::client::{ChatClient, ClientEvent, MessageBody};
use crate::config::ClientConfig;

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// Function handler to kickoff the terminal client:
///     - Generate an RSA keypair and connect to the server
///     - Print everything the server sends while reading lines from stdin
///     - `/users` shows the last roster, `/quit` (or EOF) leaves the room
pub async fn run(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Connecting to {} as {}", config.addr(), config.identity));

    let connected = ChatClient::connect(&config).await;
    spinner.finish_and_clear();
    let (client, mut events) = connected?;
    println!("Connected to {} as {}{}{}", config.addr(), BOLD, client.identity(), RESET);
    println!("{}Type a message and press enter. /users lists the room, /quit leaves.{}", DIM, RESET);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut roster: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let ClientEvent::UserList(users) = &event {
                    roster = users.clone();
                }
                let finished = event == ClientEvent::Disconnected;
                print_event(&event);
                if finished {
                    break;
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    "/quit" => break,
                    "/users" => println!("{}Online ({}): {}{}", DIM, roster.len(), roster.join(", "), RESET),
                    text => {
                        if let Err(e) = client.send(text).await {
                            warn!("Send failed: {}", e);
                            println!("{}Message not sent: {}{}", RED, e, RESET);
                            if e.is_terminal() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Message { sender, body, .. } => match body {
            MessageBody::Decrypted(text) => println!("{}{}{}: {} {}[encrypted]{}", BOLD, sender, RESET, text, GREEN, RESET),
            MessageBody::Plain(text) => println!("{}{}{}: {}", BOLD, sender, RESET, text),
            MessageBody::Undecryptable(_) => {
                println!("{}{}{}: {}[could not decrypt message]{}", BOLD, sender, RESET, RED, RESET)
            }
        },
        ClientEvent::UserList(users) => println!("{}Online: {}{}", DIM, users.join(", "), RESET),
        ClientEvent::System(text) => println!("{}* {}{}", YELLOW, text, RESET),
        ClientEvent::AuthError(text) => println!("{}Authentication failed: {}{}", RED, text, RESET),
        ClientEvent::SecureChannel => println!("{}Secure channel established{}", GREEN, RESET),
        ClientEvent::Diagnostic(text) => println!("{}! {}{}", RED, text, RESET),
        ClientEvent::Disconnected => println!("{}Disconnected from server{}", DIM, RESET),
    }
}
