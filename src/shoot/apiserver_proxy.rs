//! apiserver-proxy rewrites
//!
//! The upstream apiserver-proxy runs in the host network namespace, installs
//! the service IP on a host interface via a `setup` init container and keeps it
//! there with a `sidecar`. In the managed environment the proxy runs as a
//! regular pod instead, so those containers go away, Envoy listens on the
//! wildcard address and the proxy container exposes 443 directly.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Container, ContainerPort, PodSpec};
use regex::{NoExpand, Regex};

use crate::{Error, Result};

/// Data key holding the Envoy configuration in the apiserver-proxy ConfigMap
pub const ENVOY_CONFIG_KEY: &str = "envoy.yaml";

/// Init container that installs the service IP on the host
pub const SETUP_INIT_CONTAINER: &str = "setup";

/// Sidecar that keeps the host interface configured
pub const SIDECAR_CONTAINER: &str = "sidecar";

/// The Envoy container
pub const PROXY_CONTAINER: &str = "proxy";

/// Name of the port added to the proxy container
pub const HTTPS_PORT_NAME: &str = "https";

/// Port added to the proxy container
pub const HTTPS_PORT: i32 = 443;

/// Address Envoy listeners are rewritten to
pub const WILDCARD_ADDRESS: &str = "0.0.0.0";

static ENVOY_ADDRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"address: "?(?:[0-9]{1,3}\.){3}[0-9]{1,3}"?"#).expect("envoy address regex is valid")
});

/// Rewrite the apiserver-proxy DaemonSet to run without host networking.
///
/// Never fails. Not idempotent: every call appends another https port to the
/// proxy container.
pub fn mutate_apiserver_proxy_daemon_set(daemon_set: &mut DaemonSet) -> Result<()> {
    if let Some(pod_spec) = daemon_set
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    {
        rewrite_pod_spec(pod_spec);
    }
    Ok(())
}

fn rewrite_pod_spec(pod_spec: &mut PodSpec) {
    if pod_spec.host_network == Some(true) {
        pod_spec.host_network = Some(false);
    }

    if let Some(init_containers) = pod_spec.init_containers.as_mut() {
        init_containers.retain(|c| c.name != SETUP_INIT_CONTAINER);
    }

    let containers = std::mem::take(&mut pod_spec.containers);
    pod_spec.containers = containers
        .into_iter()
        .filter(|c| c.name != SIDECAR_CONTAINER)
        .map(|mut c| {
            if c.name == PROXY_CONTAINER {
                add_https_port(&mut c);
            }
            c
        })
        .collect();
}

fn add_https_port(container: &mut Container) {
    container
        .ports
        .get_or_insert_with(Vec::new)
        .push(ContainerPort {
            name: Some(HTTPS_PORT_NAME.to_string()),
            container_port: HTTPS_PORT,
            ..Default::default()
        });
}

/// Point every IPv4 listener address in the apiserver-proxy Envoy config at
/// the wildcard address.
///
/// Fails with [`Error::MissingKey`] if the ConfigMap has no `envoy.yaml`; the
/// data is left without that key in that case.
pub fn mutate_apiserver_proxy_envoy_config(config_map: &mut ConfigMap) -> Result<()> {
    let data = config_map.data.get_or_insert_with(BTreeMap::new);

    let envoy_config = data
        .get_mut(ENVOY_CONFIG_KEY)
        .ok_or_else(|| Error::missing_key(ENVOY_CONFIG_KEY))?;
    *envoy_config = rewrite_envoy_addresses(envoy_config);
    Ok(())
}

/// Replace every `address: <ipv4>` (quoted or not) with `address: "0.0.0.0"`.
///
/// Purely textual; the YAML is never parsed. IPv6 addresses are left alone.
pub fn rewrite_envoy_addresses(config: &str) -> String {
    let replacement = format!("address: \"{WILDCARD_ADDRESS}\"");
    ENVOY_ADDRESS_REGEX
        .replace_all(config, NoExpand(&replacement))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    /// A trimmed version of the Envoy config the apiserver-proxy ships with
    const ENVOY_PROXY_CONFIG: &str = r#"static_resources:
  listeners:
  - name: kube_apiserver
    address:
      socket_address:
        address: "192.168.192.1"
        port_value: 443
  - name: kube_apiserver_secondary
    address:
      socket_address:
        address: "192.168.192.1"
        port_value: 8443
  - name: metrics
    address:
      socket_address:
        address: "::"
        port_value: 16910
"#;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("registry.example/{name}:v1")),
            ..Default::default()
        }
    }

    fn port(name: &str, number: i32) -> ContainerPort {
        ContainerPort {
            name: Some(name.to_string()),
            container_port: number,
            ..Default::default()
        }
    }

    fn daemon_set(pod_spec: PodSpec) -> DaemonSet {
        DaemonSet {
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    spec: Some(pod_spec),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_spec_of(ds: &DaemonSet) -> &PodSpec {
        ds.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn names(containers: &[Container]) -> Vec<&str> {
        containers.iter().map(|c| c.name.as_str()).collect()
    }

    fn envoy_config_map(config: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(
                ENVOY_CONFIG_KEY.to_string(),
                config.to_string(),
            )])),
            ..Default::default()
        }
    }

    // =========================================================================
    // DaemonSet rewrite
    // =========================================================================

    #[test]
    fn test_host_network_disabled() {
        let mut ds = daemon_set(PodSpec {
            host_network: Some(true),
            containers: vec![container(PROXY_CONTAINER)],
            ..Default::default()
        });

        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();
        assert_eq!(pod_spec_of(&ds).host_network, Some(false));

        let mut ds = daemon_set(PodSpec {
            host_network: Some(false),
            ..Default::default()
        });
        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();
        assert_eq!(pod_spec_of(&ds).host_network, Some(false));
    }

    #[test]
    fn test_unset_host_network_stays_unset() {
        let mut ds = daemon_set(PodSpec::default());
        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();
        assert_eq!(pod_spec_of(&ds).host_network, None);
    }

    #[test]
    fn test_adjacent_setup_init_containers_all_removed() {
        let mut ds = daemon_set(PodSpec {
            init_containers: Some(vec![
                container("wait"),
                container(SETUP_INIT_CONTAINER),
                container(SETUP_INIT_CONTAINER),
                container("migrate"),
                container(SETUP_INIT_CONTAINER),
            ]),
            ..Default::default()
        });

        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();

        let init = pod_spec_of(&ds).init_containers.as_deref().unwrap();
        assert_eq!(names(init), vec!["wait", "migrate"]);
    }

    #[test]
    fn test_proxy_gets_https_port_and_sidecar_dropped() {
        let mut proxy = container(PROXY_CONTAINER);
        proxy.ports = Some(vec![port("metrics", 16910)]);
        let mut ds = daemon_set(PodSpec {
            containers: vec![
                container("first"),
                container(SIDECAR_CONTAINER),
                proxy,
                container("last"),
            ],
            ..Default::default()
        });

        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();

        let containers = &pod_spec_of(&ds).containers;
        assert_eq!(names(containers), vec!["first", PROXY_CONTAINER, "last"]);

        let ports = containers[1].ports.as_deref().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0], port("metrics", 16910));
        assert_eq!(ports[1], port(HTTPS_PORT_NAME, HTTPS_PORT));

        assert_eq!(containers[0], container("first"));
        assert_eq!(containers[2], container("last"));
    }

    #[test]
    fn test_proxy_without_ports_gets_https_port() {
        let mut ds = daemon_set(PodSpec {
            containers: vec![container(PROXY_CONTAINER)],
            ..Default::default()
        });

        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();

        let ports = pod_spec_of(&ds).containers[0].ports.as_deref().unwrap();
        assert_eq!(ports, &[port(HTTPS_PORT_NAME, HTTPS_PORT)]);
    }

    #[test]
    fn test_second_rewrite_appends_another_port() {
        let mut ds = daemon_set(PodSpec {
            containers: vec![container(PROXY_CONTAINER)],
            ..Default::default()
        });

        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();
        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();

        let ports = pod_spec_of(&ds).containers[0].ports.as_deref().unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| *p == port(HTTPS_PORT_NAME, HTTPS_PORT)));
    }

    #[test]
    fn test_daemon_set_without_pod_spec_is_untouched() {
        let mut ds = DaemonSet::default();
        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();
        assert_eq!(ds, DaemonSet::default());

        let mut ds = DaemonSet {
            spec: Some(DaemonSetSpec::default()),
            ..Default::default()
        };
        mutate_apiserver_proxy_daemon_set(&mut ds).unwrap();
        assert!(ds.spec.unwrap().template.spec.is_none());
    }

    // =========================================================================
    // Envoy config rewrite
    // =========================================================================

    #[test]
    fn test_envoy_ipv4_addresses_rewritten() {
        let mut cm = envoy_config_map(ENVOY_PROXY_CONFIG);

        mutate_apiserver_proxy_envoy_config(&mut cm).unwrap();

        let config = &cm.data.as_ref().unwrap()[ENVOY_CONFIG_KEY];
        assert_eq!(config.matches(r#"address: "0.0.0.0""#).count(), 2);
        assert!(!config.contains("192.168.192.1"));
        assert!(config.contains(r#"address: "::""#));
        assert_eq!(
            config,
            &ENVOY_PROXY_CONFIG.replace("192.168.192.1", WILDCARD_ADDRESS)
        );
    }

    #[test]
    fn test_unquoted_address_gets_quoted() {
        assert_eq!(
            rewrite_envoy_addresses("  address: 10.0.0.1\n"),
            "  address: \"0.0.0.0\"\n"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let once = rewrite_envoy_addresses(ENVOY_PROXY_CONFIG);
        assert_eq!(rewrite_envoy_addresses(&once), once);
    }

    #[test]
    fn test_address_pattern_needs_space_and_dotted_quad() {
        let untouched = "address:\n  socket_address:\n    address: localhost\nremote_address: fe80::1\n";
        assert_eq!(rewrite_envoy_addresses(untouched), untouched);
    }

    #[test]
    fn test_missing_envoy_key_fails_without_adding_it() {
        let mut cm = ConfigMap {
            data: Some(BTreeMap::from([("other".to_string(), "x".to_string())])),
            ..Default::default()
        };

        let err = mutate_apiserver_proxy_envoy_config(&mut cm).unwrap_err();
        assert!(matches!(&err, Error::MissingKey { key } if key == ENVOY_CONFIG_KEY));
        assert_eq!(
            cm.data.unwrap(),
            BTreeMap::from([("other".to_string(), "x".to_string())])
        );
    }

    #[test]
    fn test_nil_data_is_initialised_then_rejected() {
        let mut cm = ConfigMap::default();

        let err = mutate_apiserver_proxy_envoy_config(&mut cm).unwrap_err();
        assert!(matches!(err, Error::MissingKey { .. }));
        assert_eq!(cm.data, Some(BTreeMap::new()));
    }

    #[test]
    fn test_other_keys_are_preserved() {
        let mut cm = envoy_config_map("address: 1.2.3.4");
        cm.data
            .as_mut()
            .unwrap()
            .insert("bootstrap.sh".to_string(), "address: 5.6.7.8".to_string());

        mutate_apiserver_proxy_envoy_config(&mut cm).unwrap();

        let data = cm.data.unwrap();
        assert_eq!(data[ENVOY_CONFIG_KEY], r#"address: "0.0.0.0""#);
        assert_eq!(data["bootstrap.sh"], "address: 5.6.7.8");
    }
}
