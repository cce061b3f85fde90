//! Client for the access-control service that owns the camera list.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::config::CameraConfig;

/// One entry of `GET streams/`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamRecord {
    pub camera_id: String,
    pub stream_ip: String,
    pub stream_port: u16,
    #[serde(default)]
    pub stream_path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// One entry of `GET stream-to-gate-mapping/`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateMapping {
    pub camera_id: String,
    pub gate_id: String,
}

pub struct AcsClient {
    agent: ureq::Agent,
    base_url: String,
}

impl AcsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn fetch_streams(&self) -> Result<Vec<StreamRecord>> {
        self.get_json("streams/")
    }

    /// Camera to gate mapping. Null entries are skipped.
    pub fn fetch_gate_mapping(&self) -> Result<HashMap<String, String>> {
        let entries: Vec<Option<GateMapping>> = self.get_json("stream-to-gate-mapping/")?;
        Ok(entries
            .into_iter()
            .flatten()
            .map(|entry| (entry.camera_id, entry.gate_id))
            .collect())
    }

    /// Streams joined with their gates.
    pub fn fetch_cameras(&self) -> Result<Vec<CameraConfig>> {
        let streams = self.fetch_streams()?;
        let gates = self.fetch_gate_mapping()?;
        log::info!(
            "acs: {} streams, {} gate mappings from {}",
            streams.len(),
            gates.len(),
            self.base_url
        );
        Ok(cameras_from_records(streams, &gates))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|err| anyhow!("GET {}: {}", url, err))?;
        response
            .into_json()
            .map_err(|err| anyhow!("GET {}: invalid response body: {}", url, err))
    }
}

pub fn cameras_from_records(
    streams: Vec<StreamRecord>,
    gates: &HashMap<String, String>,
) -> Vec<CameraConfig> {
    streams
        .into_iter()
        .map(|record| CameraConfig {
            gate_id: gates.get(&record.camera_id).cloned(),
            camera_id: record.camera_id,
            url: None,
            host: Some(record.stream_ip),
            port: record.stream_port,
            path: record.stream_path,
            username: record.username.unwrap_or_default(),
            password: record.password.unwrap_or_default(),
        })
        .collect()
}
