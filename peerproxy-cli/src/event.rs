use tokio::sync::broadcast;

use peerproxy_core::contact::Role;
use peerproxy_engine::engine::EngineEvent;

use crate::ui::{describe_flags, print_prompt};

/// Spawns a task that listens for engine events and prints them.
pub fn spawn_event_printer(mut events_rx: broadcast::Receiver<EngineEvent>) {
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    print_event(event);
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("\n  ⚠ Missed {n} events");
                    print_prompt();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_event(event: EngineEvent) {
    match event {
        EngineEvent::ContactUpdated { contact } => {
            let status = if contact.is_online() {
                format!("online ({})", contact.instance_ids.join(", "))
            } else {
                "offline".to_string()
            };
            println!(
                "\n  👤 {} \"{}\" is {status}",
                contact.id.user_id, contact.display_name
            );
        }
        EngineEvent::ContactRemoved { contact } => {
            println!("\n  👤 {} was removed", contact.user_id);
        }
        EngineEvent::ConsentChanged { contact, state } => {
            println!("\n  📝 {}: {}", contact.user_id, describe_flags(&state));
        }
        EngineEvent::ConsentReached { contact, role } => {
            println!(
                "\n  🤝 {}: mutual consent to {role}; type '{} {}' to start",
                contact.user_id,
                match role {
                    Role::Getter => "get",
                    Role::Sharer => "share",
                },
                contact.user_id
            );
        }
        EngineEvent::ConsentWithdrawn { contact, role } => {
            println!("\n  🚫 {}: consent to {role} withdrawn", contact.user_id);
        }
        EngineEvent::SessionStateChanged {
            contact,
            role,
            session_id,
            state,
            endpoint,
            reason,
        } => {
            print!("\n  📡 Session #{session_id} ({role} with {}): {state}", contact.user_id);
            if let Some(endpoint) = endpoint {
                print!("  SOCKS5 at {endpoint}");
            }
            if let Some(reason) = reason {
                print!("  ({reason})");
            }
            println!();
        }
        EngineEvent::VpnStarted { contact, message } => {
            println!("\n  🛡 VPN routed through {}: {message}", contact.user_id);
        }
        EngineEvent::VpnStopped { contact, result } => match result {
            Ok(message) => println!("\n  🛡 VPN via {} stopped: {message}", contact.user_id),
            Err(e) => println!("\n  ⚠ VPN via {} failed to stop cleanly: {e}", contact.user_id),
        },
        EngineEvent::Error {
            contact,
            kind,
            message,
        } => match contact {
            Some(contact) => println!("\n  ❌ {} [{kind:?}]: {message}", contact.user_id),
            None => println!("\n  ❌ [{kind:?}] {message}"),
        },
    }
}
