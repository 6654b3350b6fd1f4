// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for cluster-envcheck.
//!
//! These tests run without a Kubernetes cluster and exercise the public API
//! of individual components in isolation.

mod kind_tests {
    use cluster_envcheck::ResourceKind;

    #[test]
    fn test_kind_display() {
        assert_eq!(ResourceKind::core("ConfigMap").to_string(), "v1/ConfigMap");
        assert_eq!(
            ResourceKind::new("apps", "v1", "Deployment").to_string(),
            "apps/v1/Deployment"
        );
    }

    #[test]
    fn test_cluster_scoped_kinds() {
        assert!(!ResourceKind::core("Namespace").namespaced);
        assert!(!ResourceKind::core("PersistentVolume").namespaced);
        assert!(!ResourceKind::new("rbac.authorization.k8s.io", "v1", "ClusterRole").namespaced);
        assert!(ResourceKind::core("Secret").namespaced);
    }

    #[test]
    fn test_defaults_cover_common_kinds() {
        let defaults = ResourceKind::defaults();
        for kind in ["ConfigMap", "Secret", "Deployment", "Namespace", "PersistentVolume"] {
            assert!(
                defaults.iter().any(|k| k.kind == kind),
                "{kind} missing from defaults"
            );
        }
    }
}

mod normalizer_tests {
    use cluster_envcheck::snapshot::{FieldPath, Normalizer, VolatileFields};
    use cluster_envcheck::{Error, RawResource};
    use serde_json::json;

    #[test]
    fn test_field_path_escapes() {
        let path = FieldPath::parse("/metadata/annotations/example.com~1rev").unwrap();
        assert_eq!(path.segments(), ["metadata", "annotations", "example.com/rev"]);
        assert!(FieldPath::parse("metadata").is_err());
        assert!(FieldPath::parse("/bad~2escape").is_err());
    }

    #[test]
    fn test_custom_volatile_path() {
        let raw = RawResource::new(
            "Deployment",
            json!({
                "metadata": {"name": "web", "namespace": "ns"},
                "spec": {"replicas": 3, "paused": false}
            }),
        );
        let volatile = VolatileFields::none()
            .with_kind_path("Deployment", FieldPath::parse("/spec/replicas").unwrap());
        let record = Normalizer::new(volatile).normalize(&raw).unwrap();
        assert!(record.field("/spec/replicas").is_none());
        assert_eq!(record.field("/spec/paused"), Some(&json!(false)));
    }

    #[test]
    fn test_missing_name_is_malformed() {
        let raw = RawResource::new("Secret", json!({"metadata": {"namespace": "ns"}}));
        let err = Normalizer::default().normalize(&raw).unwrap_err();
        assert!(matches!(err, Error::MalformedResource { .. }));
    }
}

mod report_tests {
    use cluster_envcheck::{DeltaReport, FieldChange, ResourceChange, ResourceIdentity};
    use serde_json::json;

    #[test]
    fn test_summary_wording() {
        let mut report = DeltaReport::default();
        assert_eq!(report.summary(), "no differences");

        report
            .added
            .push(ResourceIdentity::namespaced("ConfigMap", "ns", "c"));
        report
            .removed
            .push(ResourceIdentity::namespaced("ConfigMap", "ns", "b"));
        assert_eq!(report.summary(), "1 added, 1 removed");

        report.changed.push(ResourceChange {
            identity: ResourceIdentity::namespaced("Service", "ns", "web"),
            fields: vec![FieldChange {
                path: "/spec/ports/0/port".into(),
                before: Some(json!(80)),
                after: Some(json!(8080)),
            }],
        });
        assert_eq!(report.summary(), "1 added, 1 removed, 1 changed (1 field)");
        assert_eq!(report.entry_count(), 3);
        assert!(!report.is_empty());
    }

    #[test]
    fn test_display_markers() {
        let report = DeltaReport {
            added: vec![ResourceIdentity::cluster_scoped("Namespace", "leak")],
            removed: vec![ResourceIdentity::namespaced("Secret", "ns", "gone")],
            changed: Vec::new(),
        };
        let rendered = report.to_string();
        assert!(rendered.contains("+ Namespace leak"));
        assert!(rendered.contains("- Secret ns/gone"));
    }
}

mod retry_tests {
    use std::time::Duration;

    use cluster_envcheck::{RetryConfig, RetryPreset, RetryStop};

    #[test]
    fn test_preset_names() {
        assert_eq!("fast".parse::<RetryPreset>().unwrap(), RetryPreset::Fast);
        assert_eq!(RetryPreset::Patient.to_string(), "patient");
        assert_eq!(RetryConfig::default(), RetryPreset::Default.config());
    }

    #[test]
    fn test_default_preset_values() {
        let cfg = RetryPreset::Default.config();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.base_delay, Duration::from_millis(200));
        assert_eq!(cfg.max_delay, Duration::from_secs(5));
        assert_eq!(cfg.deadline, Some(Duration::from_secs(30)));
        assert_eq!(cfg.jitter, 0.2);
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(RetryStop::DeadlineExceeded.to_string(), "deadline exceeded");
        assert_eq!(RetryStop::NonRetryable.to_string(), "non-retryable");
    }
}

mod config_tests {
    use cluster_envcheck::config::RetrySelection;
    use cluster_envcheck::{EnvCheckConfig, RetryPreset};

    #[test]
    fn test_kind_map_form() {
        let config = EnvCheckConfig::from_yaml_str(
            r#"
kinds:
  - group: snapshot.storage.k8s.io
    version: v1
    kind: VolumeSnapshot
    plural: volumesnapshots
"#,
        )
        .unwrap();
        let kind = &config.kinds[0];
        assert_eq!(kind.api_version(), "snapshot.storage.k8s.io/v1");
        assert_eq!(kind.plural.as_deref(), Some("volumesnapshots"));
        assert!(kind.namespaced);
    }

    #[test]
    fn test_unknown_preset_is_rejected() {
        assert!(EnvCheckConfig::from_yaml_str("snapshot_retry: eager\n").is_err());
        let config = EnvCheckConfig::from_yaml_str("snapshot_retry: default\n").unwrap();
        assert_eq!(config.snapshot_retry, RetrySelection::Preset(RetryPreset::Default));
    }

    #[test]
    fn test_invalid_exclusion_pattern_fails_validation() {
        let config = EnvCheckConfig::from_yaml_str(
            "exclusions:\n  - kind: Pod\n    name_pattern: \"web-(\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}

mod error_tests {
    use cluster_envcheck::Error;

    #[test]
    fn test_error_classification() {
        assert!(Error::api_unavailable("reset").is_retryable());
        assert!(!Error::Unauthorized("denied".into()).is_retryable());
        assert!(!Error::config("bad").is_retryable());
        assert!(!Error::config("bad").is_not_found());
    }
}
