// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `meta.rs`

#[cfg(test)]
mod tests {
    use crate::bundle::meta::*;
    use crate::crd::MachineMeta;
    use crate::errors::BundleError;

    fn meta() -> MachineMeta {
        MachineMeta {
            hostname: "node-1".to_string(),
            interface: "eth0".to_string(),
            subnet: 24,
            gateway: "10.0.0.1".to_string(),
            dns_servers: vec!["1.1.1.1".to_string(), "9.9.9.9".to_string()],
        }
    }

    fn parse(document: &str) -> serde_yaml::Value {
        serde_yaml::from_str(document).unwrap()
    }

    #[test]
    fn test_network_meta_uses_machine_endpoint() {
        let doc = parse(&network_meta("10.0.0.21", &meta()).unwrap());

        let address = &doc["addresses"][0];
        assert_eq!(address["address"].as_str(), Some("10.0.0.21/24"));
        assert_eq!(address["linkName"].as_str(), Some("eth0"));
        assert_eq!(address["family"].as_str(), Some("inet4"));
        assert_eq!(doc["links"][0]["name"].as_str(), Some("eth0"));
        assert_eq!(doc["routes"][0]["gateway"].as_str(), Some("10.0.0.1"));
        assert_eq!(doc["routes"][0]["outLinkName"].as_str(), Some("eth0"));
        assert_eq!(doc["hostnames"][0]["hostname"].as_str(), Some("node-1"));
        assert_eq!(
            doc["resolvers"][0]["dnsServers"][1].as_str(),
            Some("9.9.9.9")
        );
    }

    #[test]
    fn test_network_meta_strips_api_port() {
        let doc = parse(&network_meta("10.0.0.21:50000", &meta()).unwrap());
        assert_eq!(doc["addresses"][0]["address"].as_str(), Some("10.0.0.21/24"));

        let v6 = MachineMeta {
            subnet: 64,
            gateway: "fd00::1".to_string(),
            ..meta()
        };
        let doc = parse(&network_meta("[fd00::21]:50000", &v6).unwrap());
        assert_eq!(doc["addresses"][0]["address"].as_str(), Some("fd00::21/64"));
        assert_eq!(doc["routes"][0]["family"].as_str(), Some("inet6"));
    }

    #[test]
    fn test_network_meta_without_hostname() {
        let doc = parse(
            &network_meta(
                "10.0.0.21",
                &MachineMeta {
                    hostname: String::new(),
                    ..meta()
                },
            )
            .unwrap(),
        );
        assert!(doc["hostnames"].as_sequence().unwrap().is_empty());
    }

    #[test]
    fn test_network_meta_rejects_unusable_settings() {
        let cases = [
            ("node.example.com", meta()),
            ("10.0.0.21", MachineMeta { subnet: 33, ..meta() }),
            ("10.0.0.21", MachineMeta { subnet: 0, ..meta() }),
            (
                "10.0.0.21",
                MachineMeta {
                    interface: String::new(),
                    ..meta()
                },
            ),
            (
                "10.0.0.21",
                MachineMeta {
                    gateway: "router".to_string(),
                    ..meta()
                },
            ),
        ];
        for (endpoint, meta) in cases {
            let err = network_meta(endpoint, &meta).unwrap_err();
            assert!(matches!(err, BundleError::InvalidMeta { .. }), "{endpoint}: {err}");
            assert_eq!(err.status_reason(), "InvalidMeta");
        }
    }
}
