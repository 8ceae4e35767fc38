//! Optional JSON seed applied to an empty store at startup.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::geo::{PostalArea, PostalDirectory};
use crate::model::{BookingOccurrence, CaregiverProfile, OwnerProfile, OwnerRequest, SlotBlock};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("reading seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing seed file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("applying seed: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedFile {
    pub postal_areas: Vec<PostalArea>,
    pub owners: Vec<OwnerProfile>,
    pub caregivers: Vec<CaregiverProfile>,
    pub blocks: Vec<SlotBlock>,
    pub requests: Vec<SeedRequest>,
}

#[derive(Debug, Deserialize)]
pub struct SeedRequest {
    pub request: OwnerRequest,
    #[serde(default)]
    pub occurrences: Vec<BookingOccurrence>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub owners: usize,
    pub caregivers: usize,
    pub blocks: usize,
    pub requests: usize,
    pub occurrences: usize,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Postal areas are not event-sourced; they are rebuilt from the seed on every start.
    pub fn directory(&self) -> PostalDirectory {
        PostalDirectory::new(self.postal_areas.iter().cloned())
    }

    /// Writes the seed through the engine. Returns `None` if the store already holds data.
    pub async fn apply(self, engine: &Engine) -> Result<Option<SeedReport>, SeedError> {
        if !engine.store.is_empty() {
            info!("store not empty, skipping seed");
            return Ok(None);
        }
        let mut report = SeedReport::default();
        for owner in self.owners {
            engine.upsert_owner(owner).await?;
            report.owners += 1;
        }
        for caregiver in self.caregivers {
            engine.upsert_caregiver(caregiver).await?;
            report.caregivers += 1;
        }
        for block in self.blocks {
            engine.add_block(block).await?;
            report.blocks += 1;
        }
        for SeedRequest { request, occurrences } in self.requests {
            report.occurrences += occurrences.len();
            engine.create_request(request, occurrences).await?;
            report.requests += 1;
        }
        info!(?report, "seed applied");
        Ok(Some(report))
    }
}
