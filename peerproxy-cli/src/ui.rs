use std::io::Write;

use peerproxy_core::consent::ConsentFlags;
use peerproxy_core::contact::LocalIdentity;
use peerproxy_engine::engine::EngineSnapshot;

/// One-line summary of a contact's consent flags.
pub fn describe_flags(flags: &ConsentFlags) -> String {
    let named = [
        (flags.local_requests_access, "you request"),
        (flags.local_offers_access, "you offer"),
        (flags.remote_requests_access, "they request"),
        (flags.remote_offers_access, "they offer"),
        (flags.ignoring_remote_offer, "ignoring their offer"),
        (flags.ignoring_remote_request, "ignoring their request"),
    ];
    let set: Vec<&str> = named
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "no consent".to_string()
    } else {
        set.join(", ")
    }
}

/// Prints the interactive prompt marker (`> `) and flushes stdout.
pub fn print_prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}

/// Prints the startup banner with identity info.
pub fn print_banner(listen_addr: &str, identity: &LocalIdentity) {
    let user = format!("{} ({})", identity.user_id, identity.display_name);
    println!();
    println!("╔══════════════════════════════════════════════════════╗");
    println!("║                  🔀  peerproxy  🔀                   ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  User     : {user:<40} ║");
    println!("║  Network  : {:<40} ║", identity.network);
    println!("║  Instance : {:<40} ║", identity.instance_id);
    println!("║  Listen   : {listen_addr:<40} ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
}

/// Prints available commands.
pub fn print_help() {
    println!();
    println!("  Commands:");
    println!("    connect <host:port>        Link with another instance");
    println!("    contacts                   Show contacts, consent and sessions");
    println!("    request | cancel-request <user>");
    println!("    offer | cancel-offer <user>");
    println!("    ignore-offer | unignore-offer <user>");
    println!("    ignore-request | unignore-request <user>");
    println!("    get <user>                 Proxy through <user>");
    println!("    share <user>               Let <user> proxy through you");
    println!("    stop get|share <user>      Stop a connected session");
    println!("    cancel get|share <user>    Abort a session still connecting");
    println!("    vpn start | vpn stop       Route the VPN through the getter session");
    println!("    help                       Show this help");
    println!("    quit                       Shut down and exit");
}

pub fn print_snapshot(snapshot: &EngineSnapshot) {
    println!();
    if snapshot.contacts.is_empty() {
        println!("  No contacts yet. Use 'connect <host:port>' to link with a friend.");
    }
    for contact in &snapshot.contacts {
        let consent = snapshot
            .consent
            .iter()
            .find(|(id, _)| *id == contact.id)
            .map_or_else(|| "no consent".to_string(), |(_, f)| describe_flags(f));
        let presence = if contact.is_online() { "online" } else { "offline" };
        println!(
            "  👤 {:<16} {presence:<8} {consent}",
            contact.id.user_id
        );
    }
    for session in &snapshot.sessions {
        print!(
            "  📡 #{} {} with {}: {}",
            session.session_id, session.role, session.peer, session.state
        );
        if let Some(endpoint) = &session.endpoint {
            print!("  SOCKS5 at {endpoint}");
        }
        println!();
    }
}

/// Reads one trimmed line from the given buffered stdin reader.
/// Returns `None` on EOF or read error.
pub async fn read_line(reader: &mut tokio::io::BufReader<tokio::io::Stdin>) -> Option<String> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_describing_flags_expect_only_set_ones() {
        let flags = ConsentFlags {
            local_requests_access: true,
            local_offers_access: false,
            remote_requests_access: false,
            remote_offers_access: true,
            ignoring_remote_offer: false,
            ignoring_remote_request: false,
        };
        assert_eq!(describe_flags(&flags), "you request, they offer");
    }

    #[test]
    fn when_describing_empty_flags_expect_no_consent() {
        let flags = ConsentFlags {
            local_requests_access: false,
            local_offers_access: false,
            remote_requests_access: false,
            remote_offers_access: false,
            ignoring_remote_offer: false,
            ignoring_remote_request: false,
        };
        assert_eq!(describe_flags(&flags), "no consent");
    }
}
