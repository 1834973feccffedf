//! Command dispatch: one arm per [`Command`] variant, mirroring the
//! teacher's one-method-per-RPC shape (`kv_service`/`watch_service`) but
//! over a plain `match` instead of a generated trait.

use std::net::SocketAddr;

use log::{debug, info, warn};

use crate::codec::{Command, Notice, SubscriberSnapshot};
use crate::metrics;
use crate::registry::Registry;
use crate::types::Mode;

/// A notice addressed to a specific endpoint. Most commands reply only to
/// their own sender, but `unregister` notifies the subscriber's stored
/// endpoint (which may differ from `from`) and `stop` fans out to every
/// registered subscriber across both modes.
pub type Reply = (SocketAddr, Notice);

/// Shared broker state a dispatched command needs. `stop_tx` is a broadcast
/// sender used to fan a global `stop` command out to both stream workers.
pub struct Dispatcher<'a> {
    pub registry: &'a Registry,
    pub ttl: i64,
    pub enabled_modes: &'a [Mode],
    pub stop_tx: &'a tokio::sync::broadcast::Sender<()>,
}

impl<'a> Dispatcher<'a> {
    /// Handle one command from `from`, returning the notices to send and
    /// the endpoint each is addressed to (reply routing per spec §4.3/§6).
    pub fn dispatch(&self, command: Command, from: SocketAddr) -> Vec<Reply> {
        match command {
            Command::Register { name, mode } => {
                if !self.enabled_modes.contains(&mode) {
                    warn!("register for disabled mode {mode} from {from}");
                    return vec![(
                        from,
                        Notice::Error {
                            data: format!("mode {mode} is disabled"),
                        },
                    )];
                }
                match self.registry.register(name.clone(), mode, from, self.ttl) {
                    Ok(()) => {
                        info!("registered {name} ({mode}) from {from}");
                        metrics::REGISTRATIONS.with_label_values(&[mode.as_str()]).inc();
                        metrics::ACTIVE_SUBSCRIBERS
                            .with_label_values(&[mode.as_str()])
                            .set(self.registry.count(mode) as i64);
                        // Spec: register has no success reply.
                        vec![]
                    }
                    Err(err) => vec![(
                        from,
                        Notice::Error {
                            data: err.to_string(),
                        },
                    )],
                }
            }
            Command::Unregister { name } => match self.registry.unregister(&name) {
                Ok(record) => {
                    info!("unregistered {name}");
                    vec![(record.endpoint, Notice::ClientDelete { name })]
                }
                Err(err) => vec![(
                    from,
                    Notice::Error {
                        data: err.to_string(),
                    },
                )],
            },
            Command::Refresh { name } => match self.registry.refresh(&name, self.ttl) {
                Ok(()) => {
                    debug!("refreshed lease for {name}");
                    vec![]
                }
                Err(err) => vec![(
                    from,
                    Notice::Error {
                        data: err.to_string(),
                    },
                )],
            },
            Command::SetSubs { name, subs } => {
                self.subs_reply(from, self.registry.set_subs(&name, subs))
            }
            Command::AddSubs { name, subs } => {
                self.subs_reply(from, self.registry.add_subs(&name, subs))
            }
            Command::RemSubs { name, subs } => {
                self.subs_reply(from, self.registry.rem_subs(&name, subs))
            }
            Command::Info { name } => match self.registry.info(&name) {
                Some(record) => vec![(
                    from,
                    Notice::ClientInfo {
                        name,
                        data: SubscriberSnapshot {
                            endpoint: record.endpoint.to_string(),
                            filter: record.filter,
                            lease: record.lease,
                        },
                    },
                )],
                None => vec![(
                    from,
                    Notice::Error {
                        data: format!("{name} is not registered"),
                    },
                )],
            },
            Command::Ping { name } => {
                // Dual ping policy: an anonymous ping just proves the
                // broker is alive; a named ping also proves the name is
                // still registered, letting the client's self-test state
                // machine distinguish "broker down" from "I was evicted".
                vec![(from, Notice::PingAnswer { name })]
            }
            Command::IsRegistered { name } => vec![(
                from,
                Notice::Registered {
                    data: self.registry.is_registered(&name),
                },
            )],
            Command::Stop {} => {
                info!("global stop requested by {from}");
                let mut replies = Vec::new();
                for mode in Mode::all() {
                    for (name, record) in self.registry.snapshot(mode) {
                        replies.push((record.endpoint, Notice::Stop { name }));
                    }
                }
                let _ = self.stop_tx.send(());
                replies
            }
        }
    }

    fn subs_reply(
        &self,
        from: SocketAddr,
        result: Result<(), crate::registry::RegistryError>,
    ) -> Vec<Reply> {
        match result {
            Ok(()) => vec![],
            Err(err) => vec![(
                from,
                Notice::Error {
                    data: err.to_string(),
                },
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriberName;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
    }

    fn dispatcher<'a>(
        registry: &'a Registry,
        stop_tx: &'a tokio::sync::broadcast::Sender<()>,
    ) -> Dispatcher<'a> {
        Dispatcher {
            registry,
            ttl: 30,
            enabled_modes: &[Mode::Head, Mode::Irreversible],
            stop_tx,
        }
    }

    #[test]
    fn register_success_has_no_reply() {
        let registry = Registry::new();
        let (tx, _rx) = tokio::sync::broadcast::channel(1);
        let d = dispatcher(&registry, &tx);
        let name = SubscriberName::new("a").unwrap();

        let reply = d.dispatch(
            Command::Register {
                name: name.clone(),
                mode: Mode::Head,
            },
            addr(),
        );
        assert!(reply.is_empty());
        assert!(registry.is_registered(&name));
    }

    #[test]
    fn register_then_duplicate_returns_error_notice() {
        let registry = Registry::new();
        let (tx, _rx) = tokio::sync::broadcast::channel(1);
        let d = dispatcher(&registry, &tx);
        let name = SubscriberName::new("a").unwrap();

        d.dispatch(
            Command::Register {
                name: name.clone(),
                mode: Mode::Head,
            },
            addr(),
        );

        let reply = d.dispatch(
            Command::Register {
                name,
                mode: Mode::Head,
            },
            addr(),
        );
        assert!(matches!(reply.as_slice(), [(_, Notice::Error { .. })]));
    }

    #[test]
    fn register_on_disabled_mode_is_rejected() {
        let registry = Registry::new();
        let (tx, _rx) = tokio::sync::broadcast::channel(1);
        let mut d = dispatcher(&registry, &tx);
        d.enabled_modes = &[Mode::Head];
        let name = SubscriberName::new("a").unwrap();

        let reply = d.dispatch(
            Command::Register {
                name,
                mode: Mode::Irreversible,
            },
            addr(),
        );
        assert!(matches!(reply.as_slice(), [(_, Notice::Error { .. })]));
        assert_eq!(registry.count(Mode::Irreversible), 0);
    }

    #[test]
    fn unregister_sends_client_delete_to_stored_endpoint() {
        let registry = Registry::new();
        let (tx, _rx) = tokio::sync::broadcast::channel(1);
        let d = dispatcher(&registry, &tx);
        let name = SubscriberName::new("a").unwrap();
        let stored_endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5555);

        d.dispatch(
            Command::Register {
                name: name.clone(),
                mode: Mode::Head,
            },
            stored_endpoint,
        );

        // Unregister requested from a different address than the one the
        // subscriber registered with (e.g. an admin tool) still notifies
        // the stored endpoint, not the requester.
        let reply = d.dispatch(Command::Unregister { name: name.clone() }, addr());
        assert_eq!(
            reply,
            vec![(stored_endpoint, Notice::ClientDelete { name: name.clone() })]
        );
        assert!(!registry.is_registered(&name));
    }

    #[test]
    fn stop_notifies_every_subscriber_in_both_modes_and_broadcasts() {
        let registry = Registry::new();
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        let d = dispatcher(&registry, &tx);

        let head_endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1111);
        let irr_endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2222);
        let head_name = SubscriberName::new("h").unwrap();
        let irr_name = SubscriberName::new("i").unwrap();
        registry
            .register(head_name.clone(), Mode::Head, head_endpoint, 30)
            .unwrap();
        registry
            .register(irr_name.clone(), Mode::Irreversible, irr_endpoint, 30)
            .unwrap();

        let reply = d.dispatch(Command::Stop {}, addr());
        assert_eq!(reply.len(), 2);
        assert!(reply.contains(&(head_endpoint, Notice::Stop { name: head_name })));
        assert!(reply.contains(&(irr_endpoint, Notice::Stop { name: irr_name })));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn is_registered_reflects_live_state() {
        let registry = Registry::new();
        let (tx, _rx) = tokio::sync::broadcast::channel(1);
        let d = dispatcher(&registry, &tx);
        let name = SubscriberName::new("a").unwrap();

        let reply = d.dispatch(Command::IsRegistered { name: name.clone() }, addr());
        assert_eq!(reply, vec![(addr(), Notice::Registered { data: false })]);

        d.dispatch(
            Command::Register {
                name: name.clone(),
                mode: Mode::Head,
            },
            addr(),
        );
        let reply = d.dispatch(Command::IsRegistered { name }, addr());
        assert_eq!(reply, vec![(addr(), Notice::Registered { data: true })]);
    }
}
