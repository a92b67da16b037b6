//! Unit tests for valkey-reshard.
//!
//! These tests run without a Valkey cluster and exercise the public API of
//! individual components in isolation.

// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

mod error_tests {
    use std::time::Duration;

    use valkey_reshard::Error;
    use valkey_reshard::client::{NodeAddress, ValkeyError};
    use valkey_reshard::error::{ConfigError, ProbeError};
    use valkey_reshard::slots::SlotError;

    fn node() -> NodeAddress {
        NodeAddress::new("127.0.0.1", 50002)
    }

    #[test]
    fn test_transfer_errors_carry_slot() {
        let timeout = Error::TransferTimeout {
            slot: 15495,
            timeout: Duration::from_millis(2000),
            message: "IOERR error or timeout reading to target instance".to_string(),
            finalized: true,
        };
        assert_eq!(timeout.slot(), Some(15495));
        assert!(timeout.is_retryable());

        let finalize = Error::FinalizationFailed {
            slot: 7,
            node: node(),
            source: ValkeyError::Server("ERR I still hold keys".to_string()),
        };
        assert_eq!(finalize.slot(), Some(7));
        assert!(finalize.is_retryable());
    }

    #[test]
    fn test_retry_follows_source_classification() {
        let busy = Error::TransferFailed {
            slot: 1,
            source: ValkeyError::Server("BUSYKEY Target key name already exists.".to_string()),
            finalized: true,
        };
        assert!(!busy.is_retryable());

        let down = Error::SetSlotFailed {
            slot: 1,
            node: node(),
            state: "IMPORTING".to_string(),
            source: ValkeyError::Connection("connection refused".to_string()),
        };
        assert!(down.is_retryable());

        let tryagain = Error::Valkey(ValkeyError::Server(
            "TRYAGAIN Multiple keys request during rehashing of slot".to_string(),
        ));
        assert!(tryagain.is_retryable());
    }

    #[test]
    fn test_permanent_errors() {
        let errors = [
            Error::NoOwnerFound { slot: 3 },
            Error::InvalidMigration {
                slot: 3,
                reason: "source and destination are the same node".to_string(),
            },
            Error::Slot(SlotError::OutOfRange(16384)),
            Error::Probe(ProbeError::AlreadyRunning),
            Error::Config(ConfigError::Missing("RESHARD_SLOT")),
        ];
        for error in errors {
            assert!(!error.is_retryable(), "{} should not be retryable", error);
        }
    }

    #[test]
    fn test_slot_absent_for_cluster_wide_errors() {
        let error = Error::TopologyUnavailable {
            address: node(),
            source: ValkeyError::Connection("refused".to_string()),
        };
        assert_eq!(error.slot(), None);
        assert!(error.to_string().contains("127.0.0.1:50002"));
    }

    #[test]
    fn test_error_display() {
        let error = Error::NoOwnerFound { slot: 42 };
        assert_eq!(error.to_string(), "No owner found for slot 42");

        let error = Error::Config(ConfigError::Invalid {
            var: "RESHARD_SLOT",
            value: "abc".to_string(),
            reason: "not a slot".to_string(),
        });
        assert!(error.to_string().contains("RESHARD_SLOT"));
    }
}

mod redirect_tests {
    use valkey_reshard::client::{NodeAddress, Redirect, RedirectKind, ValkeyError};

    #[test]
    fn test_parse_moved() {
        let redirect = Redirect::parse("MOVED 3999 127.0.0.1:6381").unwrap();
        assert_eq!(redirect.kind, RedirectKind::Moved);
        assert_eq!(redirect.slot, 3999);
        assert_eq!(redirect.address, NodeAddress::new("127.0.0.1", 6381));
        assert_eq!(redirect.to_string(), "MOVED 3999 127.0.0.1:6381");
    }

    #[test]
    fn test_parse_ask_inside_wrapped_message() {
        let redirect = Redirect::parse("Redirection error: ASK 15495 10.0.0.3:50003").unwrap();
        assert_eq!(redirect.kind, RedirectKind::Ask);
        assert_eq!(redirect.slot, 15495);
        assert_eq!(redirect.address.port, 50003);
    }

    #[test]
    fn test_non_redirect_is_none() {
        assert!(Redirect::parse("ERR unknown command").is_none());
        assert!(Redirect::parse("MOVED abc").is_none());
    }

    #[test]
    fn test_from_reply() {
        let error = ValkeyError::from_reply("ASK 12 127.0.0.1:50002");
        assert!(error.is_redirect());
        assert_eq!(error.redirect().unwrap().slot, 12);

        let error = ValkeyError::from_reply("CLUSTERDOWN Hash slot not served");
        assert!(!error.is_redirect());
        assert!(error.is_transient());
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_migrate_ioerr_is_timeout() {
        let error = ValkeyError::from_reply("IOERR error or timeout reading to target instance");
        assert!(error.is_timeout());
    }
}

mod cluster_nodes_tests {
    use valkey_reshard::client::{NodeAddress, NodeRole, ParsedClusterNodes, SlotMarker};

    const SOURCE: &str = "07c37dfeb235213a872192d90877d0cd55635b91";
    const DEST: &str = "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca";

    fn output() -> String {
        format!(
            "{dest} 127.0.0.1:50001@60001 master - 0 1426238316232 1 connected 0-5460\n\
             67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:50002@60002 master - 0 1426238316232 2 connected 5461-10922\n\
             {source} 127.0.0.1:50003@60003,valkey-2 myself,master - 0 0 3 connected 10923-16383 [15495->-{dest}]\n\
             292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:50004@60004 slave {source} 0 1426238317239 3 connected\n",
            dest = DEST,
            source = SOURCE,
        )
    }

    #[test]
    fn test_parse_masters_and_replicas() {
        let parsed = ParsedClusterNodes::parse(&output()).unwrap();
        assert_eq!(parsed.nodes.len(), 4);
        assert_eq!(parsed.masters().len(), 3);
        assert_eq!(parsed.replicas().len(), 1);
        assert_eq!(parsed.replicas()[0].master_id.as_deref(), Some(SOURCE));
        assert_eq!(parsed.replicas()[0].role(), NodeRole::Replica);
        assert_eq!(parsed.total_slots_assigned(), 16384);
    }

    #[test]
    fn test_parse_myself_with_marker() {
        let parsed = ParsedClusterNodes::parse(&output()).unwrap();
        let myself = parsed.myself().unwrap();
        assert_eq!(myself.node_id, SOURCE);
        assert_eq!(myself.hostname.as_deref(), Some("valkey-2"));
        assert_eq!(myself.cluster_bus_port, 60003);
        assert!(myself.lists_slot(15495));
        assert_eq!(
            myself.markers,
            vec![SlotMarker::Migrating {
                slot: 15495,
                node_id: DEST.to_string(),
            }]
        );
        assert_eq!(parsed.open_slots().len(), 1);
    }

    #[test]
    fn test_listed_owner() {
        let parsed = ParsedClusterNodes::parse(&output()).unwrap();
        let owner = parsed.listed_owner(5461).unwrap();
        assert_eq!(owner.address, NodeAddress::new("127.0.0.1", 50002));
        assert_eq!(parsed.node_at(&NodeAddress::new("127.0.0.1", 50001)).unwrap().node_id, DEST);
    }

    #[test]
    fn test_importing_marker() {
        let marker = SlotMarker::parse(&format!("[100-<-{}]", SOURCE)).unwrap();
        assert_eq!(marker.slot(), 100);
        assert!(matches!(marker, SlotMarker::Importing { .. }));
        assert_eq!(marker.to_string(), format!("[100-<-{}]", SOURCE));
        assert!(SlotMarker::parse("[100]").is_none());
    }

    #[test]
    fn test_short_line_is_an_error() {
        assert!(ParsedClusterNodes::parse("abc 127.0.0.1:50001@60001 master").is_err());
    }
}

mod slot_tests {
    use valkey_reshard::client::SetSlotState;
    use valkey_reshard::slots::{MigrationState, SlotMigrationTracker, key_slot};

    #[test]
    fn test_known_slots() {
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("a"), 15495);
        assert_eq!(key_slot("b{a}"), 15495);
        assert_eq!(key_slot(""), 0);
    }

    #[test]
    fn test_setslot_args() {
        assert_eq!(
            SetSlotState::Importing("abc".to_string()).args(),
            vec!["IMPORTING", "abc"]
        );
        assert_eq!(SetSlotState::Node("def".to_string()).to_string(), "NODE def");
        assert_eq!(SetSlotState::Stable.args(), vec!["STABLE"]);
    }

    #[test]
    fn test_migration_state_serializes_snake_case() {
        let json = serde_json::to_string(&MigrationState::SourceMigrating).unwrap();
        assert_eq!(json, "\"source_migrating\"");
        assert_eq!(MigrationState::DestImporting.to_string(), "dest_importing");
    }

    #[test]
    fn test_tracker_rejects_skipped_states() {
        let mut tracker = SlotMigrationTracker::new(15495, "source", "dest");
        assert!(!tracker.advance(MigrationState::Reassigned));
        assert!(tracker.advance(MigrationState::DestImporting));
        assert!(tracker.advance(MigrationState::SourceMigrating));
        assert!(tracker.advance(MigrationState::Reassigned));
        assert!(tracker.is_clean());

        tracker.record_finalize_error("50002: connection refused");
        assert!(!tracker.is_clean());
    }
}

mod report_tests {
    use std::time::Duration;

    use jiff::Timestamp;
    use valkey_reshard::probe::{MissReason, MissRecord, MissingAfterRecord, ProbeReport, ProbeTarget};

    fn report() -> ProbeReport {
        ProbeReport {
            started_at: Timestamp::UNIX_EPOCH,
            finished_at: Timestamp::UNIX_EPOCH,
            elapsed: Duration::from_millis(10_500),
            total_cycles: 10,
            stopped_early: false,
            misses: vec![
                MissRecord {
                    cycle: 4,
                    target: ProbeTarget::SortedSetMember,
                    reason: MissReason::Absent,
                },
                MissRecord {
                    cycle: 6,
                    target: ProbeTarget::HashField,
                    reason: MissReason::ReadFailed {
                        error: "CLUSTERDOWN".to_string(),
                    },
                },
            ],
            missing_after: vec![MissingAfterRecord {
                cycle: 4,
                target: ProbeTarget::SortedSetMember,
                reason: MissReason::Absent,
            }],
            events: Vec::new(),
        }
    }

    #[test]
    fn test_percentages() {
        let report = report();
        assert_eq!(report.percentage_of_misses(ProbeTarget::SortedSetMember), 10.0);
        assert_eq!(report.percentage_of_misses(ProbeTarget::Key), 0.0);
        assert!((report.downtime() - 20.0 / 3.0).abs() < 1e-9);
        assert!((report.data_loss() - 10.0 / 3.0).abs() < 1e-9);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_report_json() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["elapsed"], 10_500);
        assert_eq!(json["total_cycles"], 10);
        assert_eq!(json["misses"][0]["target"], "sorted_set_member");
        assert_eq!(json["misses"][0]["reason"]["kind"], "absent");
        assert_eq!(json["misses"][1]["reason"]["kind"], "read_failed");
        assert_eq!(json["misses"][1]["reason"]["error"], "CLUSTERDOWN");
    }

    #[test]
    fn test_summary_lists_every_target() {
        let summary = report().summary();
        assert_eq!(summary.targets.len(), 3);
        assert_eq!(summary.targets[&ProbeTarget::HashField].misses, 1);
        assert_eq!(summary.targets[&ProbeTarget::SortedSetMember].missing_after, 1);
        assert_eq!(summary.targets[&ProbeTarget::Key].percentage_of_misses, 0.0);
    }

    #[test]
    fn test_miss_reason_display() {
        let reason = MissReason::Mismatch {
            expected: "4".to_string(),
            actual: "5".to_string(),
        };
        assert_eq!(reason.to_string(), "expected \"4\", found \"5\"");
    }
}

mod event_tests {
    use valkey_reshard::events::{Event, EventKind, EventLog};
    use valkey_reshard::probe::ProbeTarget;

    #[test]
    fn test_sealed_log_rejects_events() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert!(log.note(EventKind::CycleStarted, "cycle 0"));
        log.seal();
        assert!(log.is_sealed());
        assert!(!log.note(EventKind::CycleStarted, "cycle 1"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_clones_share_events() {
        let log = EventLog::new();
        let other = log.clone();
        other.record(
            Event::new(EventKind::ReadFailed, "MOVED 12 127.0.0.1:50002")
                .with_cycle(3)
                .with_target(ProbeTarget::Key),
        );
        assert_eq!(log.count(EventKind::ReadFailed), 1);
        assert!(EventKind::ReadFailed.is_failure());
        assert!(!EventKind::CycleStarted.is_failure());

        let event = &log.snapshot()[0];
        assert_eq!(event.cycle, Some(3));
        assert_eq!(event.slot, None);
    }

    #[test]
    fn test_event_json_skips_empty_fields() {
        let json = serde_json::to_value(Event::new(EventKind::ProbeDone, "done").with_slot(9)).unwrap();
        assert_eq!(json["slot"], 9);
        assert!(json.get("cycle").is_none());
        assert!(json.get("target").is_none());
    }
}

mod config_tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use valkey_reshard::AppConfig;
    use valkey_reshard::config::Mode;
    use valkey_reshard::error::ConfigError;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.mode, Mode::Probe);
        assert_eq!(config.seed.to_string(), "127.0.0.1:50001");
        assert_eq!(config.prober.interval_between_cycles, Duration::from_millis(1000));
        assert_eq!(config.metrics_port, 8080);
        assert!(config.target.is_none());
    }

    #[test]
    fn test_migrate_requires_destination() {
        let error = load(&[("RESHARD_MODE", "migrate"), ("RESHARD_SLOT", "15495")]).unwrap_err();
        assert_eq!(error, ConfigError::Missing("RESHARD_DESTINATION"));
    }

    #[test]
    fn test_migrate_slot_list() {
        let config = load(&[
            ("RESHARD_MODE", "migrate"),
            ("RESHARD_SLOT", "1,5-7"),
            ("RESHARD_DESTINATION", "127.0.0.1:50002"),
        ])
        .unwrap();
        let target = config.target.unwrap();
        assert_eq!(target.slots, vec![1, 5, 6, 7]);
        assert_eq!(target.destination.port, 50002);
    }

    #[test]
    fn test_bad_mode() {
        assert!(matches!(
            load(&[("RESHARD_MODE", "rebalance")]),
            Err(ConfigError::Invalid { var: "RESHARD_MODE", .. })
        ));
    }
}
