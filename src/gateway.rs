//! Validation gateway.
//!
//! Bridges a synchronous "is this plate at the gate" request to the
//! asynchronous recognition stage: it opens the recognition window, polls the
//! candidate queue until a match or the deadline, and always closes the
//! window on the way out. Requests are admitted one at a time; a waiting
//! request spends its own budget while it waits.

use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::plate::clean_text;
use crate::queue::EvictingQueue;
use crate::registry::{CardVehicleRecord, PlateRegistry};
use crate::signal::RecognitionWindow;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound on a single request's budget.
pub const MAX_VALIDATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// What a candidate has to match for the request to succeed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchPolicy {
    /// A candidate equal to this plate.
    Plate(String),
    /// A candidate equal to any plate in the remote card registry.
    Registry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationRequest {
    pub policy: MatchPolicy,
    pub gate_position: Option<String>,
    pub timeout: Duration,
}

impl ValidationRequest {
    pub fn plate(plate_number: &str, gate_position: &str, timeout: Duration) -> Self {
        Self {
            policy: MatchPolicy::Plate(clean_text(plate_number)),
            gate_position: Some(gate_position.to_string()),
            timeout,
        }
    }

    pub fn registry(timeout: Duration) -> Self {
        Self {
            policy: MatchPolicy::Registry,
            gate_position: None,
            timeout,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub status: ValidationStatus,
}

impl ValidationVerdict {
    pub const VALID: ValidationVerdict = ValidationVerdict {
        status: ValidationStatus::Valid,
    };
    pub const INVALID: ValidationVerdict = ValidationVerdict {
        status: ValidationStatus::Invalid,
    };

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

pub struct ValidationGateway {
    window: RecognitionWindow,
    candidates: EvictingQueue<String>,
    registry: Option<Arc<dyn PlateRegistry>>,
    poll_interval: Duration,
    in_flight: Mutex<bool>,
    released: Condvar,
}

impl ValidationGateway {
    pub fn new(
        window: RecognitionWindow,
        candidates: EvictingQueue<String>,
        registry: Option<Arc<dyn PlateRegistry>>,
    ) -> Self {
        Self {
            window,
            candidates,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            in_flight: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// True when registry-backed validation is available.
    pub fn has_registry(&self) -> bool {
        self.registry.is_some()
    }

    /// Resolve `request` within its timeout. Never fails: a timeout, a busy
    /// gateway or an unavailable registry all resolve to invalid.
    pub fn validate(&self, request: &ValidationRequest) -> ValidationVerdict {
        let deadline = Instant::now() + request.timeout.min(MAX_VALIDATION_TIMEOUT);
        let Some(_admission) = self.admit(deadline) else {
            log::warn!(
                "validation for gate {:?} timed out waiting for an earlier request",
                request.gate_position
            );
            return ValidationVerdict::INVALID;
        };

        let stale = self.candidates.drain().len();
        if stale > 0 {
            log::debug!("discarded {} stale plate candidates", stale);
        }
        let _window = self.window.activate(request.gate_position.as_deref());
        log::debug!(
            "validating {:?} at gate {:?} for {:?}",
            request.policy,
            request.gate_position,
            request.timeout
        );

        let mut snapshot: Option<Vec<CardVehicleRecord>> = None;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.poll_interval.min(deadline - now);

            if request.policy == MatchPolicy::Registry && snapshot.is_none() {
                snapshot = self.fetch_registry();
                if snapshot.is_none() {
                    std::thread::sleep(wait);
                    continue;
                }
            }

            let Some(first) = self.candidates.recv_timeout(wait) else {
                continue;
            };
            let mut batch = vec![first];
            batch.extend(self.candidates.drain());

            if let Some(plate) = find_match(&request.policy, snapshot.as_deref(), &batch) {
                log::info!(
                    "plate {} is valid at gate {:?}",
                    plate,
                    request.gate_position
                );
                return ValidationVerdict::VALID;
            }
            log::debug!("no match among candidates {:?}", batch);
        }
        log::info!(
            "validation of {:?} at gate {:?} timed out",
            request.policy,
            request.gate_position
        );
        ValidationVerdict::INVALID
    }

    fn fetch_registry(&self) -> Option<Vec<CardVehicleRecord>> {
        let Some(registry) = &self.registry else {
            log::warn!("card registry is not configured");
            return None;
        };
        match registry.fetch() {
            Ok(records) => {
                log::debug!("fetched {} card registry records", records.len());
                Some(records)
            }
            Err(err) => {
                log::error!("could not fetch card registry: {:#}", err);
                None
            }
        }
    }

    /// Wait for the in-flight request, if any, until `deadline`.
    fn admit(&self, deadline: Instant) -> Option<Admission<'_>> {
        let mut busy = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *busy {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(busy, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            busy = guard;
        }
        *busy = true;
        Some(Admission { gateway: self })
    }
}

struct Admission<'a> {
    gateway: &'a ValidationGateway,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let mut busy = self
            .gateway
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *busy = false;
        self.gateway.released.notify_one();
    }
}

fn find_match<'a>(
    policy: &MatchPolicy,
    registry: Option<&[CardVehicleRecord]>,
    batch: &'a [String],
) -> Option<&'a str> {
    match policy {
        MatchPolicy::Plate(plate) => batch
            .iter()
            .find(|candidate| *candidate == plate)
            .map(String::as_str),
        MatchPolicy::Registry => {
            let records = registry?;
            batch
                .iter()
                .find(|candidate| {
                    records
                        .iter()
                        .any(|record| clean_text(&record.license_plate) == **candidate)
                })
                .map(String::as_str)
        }
    }
}
