//! Broker, worker and producer over mutual TLS

use njordr_core::{BrokerConfig, ItemStatus, ServiceConfig, TlsConfig};
use njordr_service::BrokerClient;
use njordr_tests::common::{
    broker_config, spawn_worker_with, unique_worker, wait_for_status, TestBroker,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

/// A throwaway CA with the broker and client identities it signed
struct TestPki {
    dir: TempDir,
}

impl TestPki {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "ca");
        write_leaf(dir.path(), &ca, "broker", "localhost");
        write_leaf(dir.path(), &ca, "client", "njordr-worker");
        Self { dir }
    }

    fn tls(&self, ca: &str, identity: &str) -> TlsConfig {
        let path = self.dir.path();
        TlsConfig {
            server_name: Some("localhost".into()),
            ..TlsConfig::mtls(
                path.join(format!("{}.pem", ca)),
                path.join(format!("{}.pem", identity)),
                path.join(format!("{}.key", identity)),
            )
        }
    }
}

fn write_ca(dir: &Path, name: &str) -> Certificate {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name.push(DnType::CommonName, name);
    let ca = Certificate::from_params(params).unwrap();
    std::fs::write(dir.join(format!("{}.pem", name)), ca.serialize_pem().unwrap()).unwrap();
    ca
}

fn write_leaf(dir: &Path, ca: &Certificate, name: &str, dns_name: &str) {
    let mut params = CertificateParams::new(vec![dns_name.to_string()]);
    params.distinguished_name.push(DnType::CommonName, name);
    let leaf = Certificate::from_params(params).unwrap();
    std::fs::write(
        dir.join(format!("{}.pem", name)),
        leaf.serialize_pem_with_signer(ca).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join(format!("{}.key", name)), leaf.serialize_private_key_pem()).unwrap();
}

async fn tls_broker(pki: &TestPki) -> TestBroker {
    TestBroker::with_config(BrokerConfig {
        tls: pki.tls("ca", "broker"),
        ..broker_config()
    })
    .await
}

fn client_config(broker: &TestBroker, tls: TlsConfig) -> ServiceConfig {
    ServiceConfig {
        tls,
        ..broker.service_config(&unique_worker("tls"))
    }
}

#[tokio::test]
async fn test_item_completes_over_mutual_tls() {
    let pki = TestPki::new();
    let broker = tls_broker(&pki).await;

    let worker = spawn_worker_with(client_config(&broker, pki.tls("ca", "client"))).await;
    let mut producer = BrokerClient::connect_config(&client_config(&broker, pki.tls("ca", "client")))
        .await
        .unwrap();

    let item_id = producer.submit("echo", json!({"secure": true})).await.unwrap();
    let item = wait_for_status(&mut producer, &item_id, ItemStatus::Completed).await;
    assert_eq!(item.attempts, 0);

    worker.stop().await;
}

#[tokio::test]
async fn test_plain_client_is_refused_by_tls_broker() {
    let pki = TestPki::new();
    let broker = tls_broker(&pki).await;

    // The handshake fails on the broker side and the connection is closed
    let mut plain = broker.client().await;
    assert!(plain.submit("echo", json!(null)).await.is_err());
    assert_eq!(broker.state.stats().await.pending, 0);
}

#[tokio::test]
async fn test_client_from_other_ca_is_refused() {
    let pki = TestPki::new();
    let broker = tls_broker(&pki).await;

    let rogue = write_ca(pki.dir.path(), "rogue-ca");
    write_leaf(pki.dir.path(), &rogue, "rogue", "njordr-worker");
    let config = client_config(&broker, pki.tls("ca", "rogue"));

    // With TLS 1.3 the broker may only reject the certificate after the
    // client considers the handshake done, so the first request fails
    let result = async {
        let mut client = BrokerClient::connect_config(&config).await?;
        client.submit("echo", json!(null)).await
    }
    .await;
    assert!(result.is_err(), "untrusted client got {:?}", result);
    assert_eq!(broker.state.stats().await.pending, 0);
}

#[tokio::test]
async fn test_broker_with_bad_certificate_fails_to_bind() {
    let pki = TestPki::new();
    std::fs::write(pki.dir.path().join("broker.key"), "garbage").unwrap();

    let config = BrokerConfig {
        tls: pki.tls("ca", "broker"),
        ..broker_config()
    };
    assert!(njordr_broker::BrokerServer::bind(config).await.is_err());
}
