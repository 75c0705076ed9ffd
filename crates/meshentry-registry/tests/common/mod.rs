//! Shared fixtures for registry integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use meshentry_registry::{DnsAnswer, Destinations, Registry, RegistryConfig, Resolve, RouteMatch};
use meshentry_state::{Location, Protocol, Resolution, ServicePort, ServiceRecord};

/// In-memory resolver whose answers are scripted per hostname.
#[derive(Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<String, Result<Vec<IpAddr>, String>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Duration,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every lookup takes `delay` before answering.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn answer(&self, host: &str, ips: &[&str]) {
        let ips = ips.iter().map(|s| ip(s)).collect();
        self.answers.lock().unwrap().insert(host.to_string(), Ok(ips));
    }

    pub fn fail(&self, host: &str, reason: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(host.to_string(), Err(reason.to_string()));
    }

    pub fn calls(&self, host: &str) -> usize {
        self.calls.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Resolve for ScriptedResolver {
    async fn lookup(&self, hostname: &str) -> Result<DnsAnswer, String> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(hostname.to_string())
            .or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let answer = self.answers.lock().unwrap().get(hostname).cloned();
        match answer {
            Some(Ok(addresses)) => Ok(DnsAnswer {
                addresses,
                ttl: None,
            }),
            Some(Err(reason)) => Err(reason),
            None => Err(format!("NXDOMAIN {hostname}")),
        }
    }
}

pub fn registry(resolver: Arc<ScriptedResolver>) -> Registry {
    Registry::spawn(RegistryConfig::default(), resolver)
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn port(number: u16, name: &str, protocol: Protocol) -> ServicePort {
    ServicePort {
        number,
        name: name.to_string(),
        protocol,
    }
}

/// A `NONE` record in the default namespace with a single HTTP port;
/// tests adjust the fields they care about.
pub fn record(name: &str) -> ServiceRecord {
    ServiceRecord {
        name: name.to_string(),
        namespace: "default".to_string(),
        hosts: vec![format!("{name}.example.com")],
        addresses: vec![],
        ports: vec![port(80, "http", Protocol::Http)],
        location: Location::MeshExternal,
        resolution: Resolution::None,
        endpoints: vec![],
    }
}

/// `address:port` for every destination of a match.
pub fn destinations(m: &RouteMatch) -> Vec<String> {
    match &m.destinations {
        Destinations::PassThrough => vec![],
        Destinations::Endpoints(dests) => dests
            .iter()
            .map(|d| format!("{}:{}", d.address, d.port))
            .collect(),
    }
}
