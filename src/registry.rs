//! Remote card-to-plate registry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardVehicleRecord {
    pub card_id: String,
    pub license_plate: String,
}

pub trait PlateRegistry: Send + Sync {
    /// Current snapshot of registered vehicles.
    fn fetch(&self) -> Result<Vec<CardVehicleRecord>>;
}

/// `GET <url>` returning a JSON array of `{cardId, licensePlate}`.
pub struct HttpPlateRegistry {
    url: String,
    agent: ureq::Agent,
}

impl HttpPlateRegistry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build(),
        }
    }
}

impl PlateRegistry for HttpPlateRegistry {
    fn fetch(&self) -> Result<Vec<CardVehicleRecord>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch card registry from {}", self.url))?;
        let body = response
            .into_string()
            .context("read card registry response")?;
        parse_records(&body)
    }
}

fn parse_records(body: &str) -> Result<Vec<CardVehicleRecord>> {
    serde_json::from_str(body).context("parse card registry response")
}

/// Fixed registry snapshot. Can be made to fail a number of fetches first.
#[derive(Clone, Default)]
pub struct StaticPlateRegistry {
    records: Vec<CardVehicleRecord>,
    failures_left: Arc<Mutex<u32>>,
    fetches: Arc<Mutex<u32>>,
}

impl StaticPlateRegistry {
    pub fn new(records: Vec<CardVehicleRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn failing_first(self, failures: u32) -> Self {
        *self
            .failures_left
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = failures;
        self
    }

    pub fn fetches(&self) -> u32 {
        *self.fetches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PlateRegistry for StaticPlateRegistry {
    fn fetch(&self) -> Result<Vec<CardVehicleRecord>> {
        *self.fetches.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        let mut failures = self
            .failures_left
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("registry unavailable");
        }
        Ok(self.records.clone())
    }
}
