use peerproxy_core::consent::UserAction;
use peerproxy_core::contact::{LocalIdentity, Role};
use peerproxy_engine::direct::DirectChannel;
use peerproxy_engine::engine::{CoreConnector, EngineCmd};
use peerproxy_engine::tcp::TcpConnector;

use crate::ui::{print_help, print_snapshot};

/// A parsed prompt line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: u16 },
    State,
    Consent { user: String, action: UserAction },
    Start { user: String, role: Role },
    Stop { user: String, role: Role },
    Cancel { user: String, role: Role },
    VpnStart,
    VpnStop,
    Help,
    Quit,
}

/// What the prompt loop drives.
pub struct Context {
    pub core: CoreConnector,
    pub channel: DirectChannel,
    pub identity: LocalIdentity,
}

fn consent_action(verb: &str) -> Option<UserAction> {
    UserAction::ALL
        .into_iter()
        .find(|a| a.as_str().replace('_', "-").eq_ignore_ascii_case(verb))
}

fn role(word: &str) -> Result<Role, String> {
    match word {
        "get" => Ok(Role::Getter),
        "share" => Ok(Role::Sharer),
        other => Err(format!("Expected 'get' or 'share', got \"{other}\".")),
    }
}

/// Parses one non-empty prompt line.
///
/// # Errors
///
/// Returns a message for the user when the line is not a valid command.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, rest)) = parts.split_first() else {
        return Err("Empty command.".into());
    };

    match (verb, rest) {
        ("connect", [addr]) => {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| format!("Expected <host>:<port>, got \"{addr}\"."))?;
            let port = port
                .parse()
                .map_err(|_| format!("Invalid port \"{port}\"."))?;
            Ok(Command::Connect {
                host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                port,
            })
        }
        ("contacts" | "state", []) => Ok(Command::State),
        ("get", [user]) => Ok(Command::Start {
            user: (*user).to_string(),
            role: Role::Getter,
        }),
        ("share", [user]) => Ok(Command::Start {
            user: (*user).to_string(),
            role: Role::Sharer,
        }),
        ("stop", [which, user]) => Ok(Command::Stop {
            user: (*user).to_string(),
            role: role(which)?,
        }),
        ("cancel", [which, user]) => Ok(Command::Cancel {
            user: (*user).to_string(),
            role: role(which)?,
        }),
        ("vpn", ["start"]) => Ok(Command::VpnStart),
        ("vpn", ["stop"]) => Ok(Command::VpnStop),
        ("help" | "?", []) => Ok(Command::Help),
        ("quit" | "exit" | "q", []) => Ok(Command::Quit),
        (verb, [user]) => consent_action(verb)
            .map(|action| Command::Consent {
                user: (*user).to_string(),
                action,
            })
            .ok_or_else(|| format!("Unknown command: \"{verb}\".")),
        (verb, _) => Err(format!("Unknown command or wrong arguments: \"{verb}\".")),
    }
}

/// Runs a parsed command. Outcomes of engine commands arrive later as
/// events.
pub async fn execute(cmd: Command, ctx: &Context) {
    let sent = match cmd {
        Command::Connect { host, port } => {
            println!("  🔗 Linking with {host}:{port}...");
            match ctx.channel.connect(&TcpConnector, &host, port).await {
                Ok(peer) => println!("  ✔ Linked with {peer}"),
                Err(e) => println!("  ❌ Link failed: {e:#}"),
            }
            return;
        }
        Command::State => {
            match ctx.core.state().await {
                Ok(snapshot) => print_snapshot(&snapshot),
                Err(e) => println!("  ❌ {e}"),
            }
            return;
        }
        Command::Consent { user, action } => {
            ctx.core
                .modify_consent(ctx.identity.contact(user), action)
                .await
        }
        Command::Start { user, role } => {
            ctx.core
                .start_session(ctx.identity.contact(user), role)
                .await
        }
        Command::Stop { user, role } => {
            ctx.core
                .stop_session(ctx.identity.contact(user), role)
                .await
        }
        Command::Cancel { user, role } => {
            ctx.core
                .cancel_session(ctx.identity.contact(user), role)
                .await
        }
        Command::VpnStart => ctx.core.send(EngineCmd::StartVpn).await,
        Command::VpnStop => ctx.core.send(EngineCmd::StopVpn).await,
        Command::Help => {
            print_help();
            return;
        }
        Command::Quit => return,
    };
    if let Err(e) = sent {
        println!("  ❌ {e}");
    }
}
