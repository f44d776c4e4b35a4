//! Per-game acquisition pass
//!
//! Walks the catalog entries of one game in order: skips what is already on
//! disk, fetches the rest, normalizes every download into its canonical file
//! and aggregates the results. A failing asset never stops the pass.

use crate::archive::{self, NormalizeResult};
use crate::auth::{AuthenticationSession, UrlOpener};
use crate::catalog::{AssetDescriptor, AssetSource, SourceCatalog};
use crate::downloaders::{Downloaders, NexusClient, NexusRateLimits, ProgressCallback};
use crate::error::OrchestratorError;
use crate::presence::PresenceDetector;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Pause between browser tabs when opening manual sources
const OPEN_DELAY: Duration = Duration::from_millis(500);

/// Progress and log reporting for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionEvent {
    Started { key: String, source: &'static str },
    Progress { key: String, bytes: u64, total: Option<u64> },
    Finished { key: String, result: AssetResult },
    Message(String),
}

pub type EventSink = Arc<dyn Fn(AcquisitionEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetResult {
    Fetched,
    AlreadyPresent,
    Failed(Failure),
}

impl AssetResult {
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, AssetResult::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    /// The host wants a paid account for this file
    pub premium_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub key: String,
    pub bytes: u64,
    pub total: Option<u64>,
    pub path: Option<PathBuf>,
    pub result: AssetResult,
}

impl DownloadOutcome {
    fn failed(key: &str, reason: String, premium_required: bool) -> Self {
        Self {
            key: key.to_string(),
            bytes: 0,
            total: None,
            path: None,
            result: AssetResult::Failed(Failure {
                reason,
                premium_required,
            }),
        }
    }
}

/// Result of a whole pass
#[derive(Debug, Clone)]
pub struct Report {
    pub game: String,
    /// Every asset fetched or already present
    pub all_satisfied: bool,
    /// Essential assets are in place and only paid-tier optional files failed
    pub qualified: bool,
    pub outcomes: Vec<DownloadOutcome>,
    pub message: String,
    /// Nexus quota as of the last API call, if the pass made any
    pub nexus_limits: Option<NexusRateLimits>,
}

impl Report {
    /// Whether installation can go ahead
    pub fn is_success(&self) -> bool {
        self.all_satisfied || self.qualified
    }

    pub fn failures(&self) -> impl Iterator<Item = &DownloadOutcome> {
        self.outcomes.iter().filter(|o| !o.result.is_satisfied())
    }
}

/// How to fetch one missing asset by hand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualInstruction {
    pub key: String,
    pub url: String,
    pub file_name: String,
    pub target_dir: PathBuf,
    pub hint: String,
    pub description: String,
}

/// Decide the overall status of a pass
fn aggregate(
    game: &str,
    descriptors: &[&AssetDescriptor],
    outcomes: &[DownloadOutcome],
) -> (bool, bool, String) {
    let failed: Vec<&DownloadOutcome> = outcomes
        .iter()
        .filter(|o| !o.result.is_satisfied())
        .collect();
    if failed.is_empty() {
        return (true, false, format!("All {} assets for {} are ready.", outcomes.len(), game));
    }

    let descriptor_of = |key: &str| descriptors.iter().find(|d| d.key == key).copied();
    let essential: Vec<&&AssetDescriptor> = descriptors.iter().filter(|d| d.essential).collect();
    let essential_ok = essential.iter().all(|d| {
        outcomes
            .iter()
            .any(|o| o.key == d.key && o.result.is_satisfied())
    });
    let only_optional_premium = failed.iter().all(|o| {
        let premium = matches!(&o.result, AssetResult::Failed(f) if f.premium_required);
        let optional_api = descriptor_of(&o.key)
            .is_some_and(|d| !d.essential && matches!(d.source, AssetSource::Api { .. }));
        premium && optional_api
    });

    if !essential.is_empty() && essential_ok && only_optional_premium {
        let message = format!(
            "Essential files for {} are ready. {} asset(s) need Nexus Mods Premium for automatic \
             download; please download them manually.",
            game,
            failed.len()
        );
        return (false, true, message);
    }

    (
        false,
        false,
        format!(
            "{} of {} assets for {} could not be downloaded.",
            failed.len(),
            outcomes.len(),
            game
        ),
    )
}

/// Drives acquisition for the games in a catalog
pub struct Orchestrator {
    catalog: SourceCatalog,
    presence: PresenceDetector,
    auth: Arc<Mutex<AuthenticationSession>>,
    downloaders: Downloaders,
    opener: Arc<dyn UrlOpener>,
    api_base: String,
    open_delay: Duration,
}

impl Orchestrator {
    pub fn new(
        catalog: SourceCatalog,
        data_root: impl Into<PathBuf>,
        auth: AuthenticationSession,
        downloaders: Downloaders,
        opener: Arc<dyn UrlOpener>,
    ) -> Self {
        let api_base = auth.config().api_base.clone();
        Self {
            catalog,
            presence: PresenceDetector::new(data_root),
            auth: Arc::new(Mutex::new(auth)),
            downloaders,
            opener,
            api_base,
            open_delay: OPEN_DELAY,
        }
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    /// The shared session; hold the lock to serialize handshakes
    pub fn auth(&self) -> Arc<Mutex<AuthenticationSession>> {
        self.auth.clone()
    }

    fn descriptors(&self, game: &str) -> Result<Vec<&AssetDescriptor>, OrchestratorError> {
        let descriptors = self.catalog.for_game(game);
        if descriptors.is_empty() {
            return Err(OrchestratorError::UnknownGame(game.to_string()));
        }
        Ok(descriptors)
    }

    async fn nexus_client(&self) -> Option<NexusClient> {
        let key = self.auth.lock().await.key().map(str::to_string)?;
        match NexusClient::with_base_url(&key, &self.api_base) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Cannot use stored API key: {:#}", e);
                None
            }
        }
    }

    /// Fetch everything `game` needs that is not on disk yet
    pub async fn download_all(
        &self,
        game: &str,
        on_event: EventSink,
    ) -> Result<Report, OrchestratorError> {
        let descriptors = self.descriptors(game)?;
        let nexus = self.nexus_client().await;
        let mut outcomes = Vec::with_capacity(descriptors.len());

        info!("Acquiring {} assets for {}", descriptors.len(), game);
        for descriptor in &descriptors {
            let outcome = self
                .acquire(descriptor, nexus.as_ref(), on_event.clone())
                .await?;
            on_event(AcquisitionEvent::Finished {
                key: outcome.key.clone(),
                result: outcome.result.clone(),
            });
            outcomes.push(outcome);
        }

        let nexus_limits = nexus
            .as_ref()
            .filter(|client| client.request_count() > 0)
            .map(NexusClient::rate_limits);
        if let Some(limits) = nexus_limits.as_ref().filter(|l| l.is_low()) {
            warn!(
                "Nexus API quota is low: {} hourly, {} daily requests left",
                limits.hourly_remaining, limits.daily_remaining
            );
        }

        let (all_satisfied, qualified, message) = aggregate(game, &descriptors, &outcomes);
        info!("{}", message);
        on_event(AcquisitionEvent::Message(message.clone()));

        Ok(Report {
            game: game.to_string(),
            all_satisfied,
            qualified,
            outcomes,
            message,
            nexus_limits,
        })
    }

    async fn acquire(
        &self,
        descriptor: &AssetDescriptor,
        nexus: Option<&NexusClient>,
        on_event: EventSink,
    ) -> Result<DownloadOutcome, OrchestratorError> {
        let output_dir = self.presence.output_dir(descriptor);
        std::fs::create_dir_all(&output_dir).map_err(|source| OrchestratorError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        if let Some(path) = self.presence.find(descriptor) {
            debug!("{} already present at {}", descriptor.key, path.display());
            let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            return Ok(DownloadOutcome {
                key: descriptor.key.clone(),
                bytes,
                total: Some(bytes),
                path: Some(path),
                result: AssetResult::AlreadyPresent,
            });
        }

        on_event(AcquisitionEvent::Started {
            key: descriptor.key.clone(),
            source: descriptor.source.kind(),
        });

        if descriptor.source.requires_auth() && nexus.is_none() {
            let reason = "Not authenticated with Nexus Mods".to_string();
            on_event(AcquisitionEvent::Message(format!("{}: {}", descriptor.key, reason)));
            return Ok(DownloadOutcome::failed(&descriptor.key, reason, false));
        }

        let progress: ProgressCallback = {
            let key = descriptor.key.clone();
            let on_event = on_event.clone();
            Arc::new(move |bytes, total| {
                on_event(AcquisitionEvent::Progress {
                    key: key.clone(),
                    bytes,
                    total,
                })
            })
        };

        let fetched = match self
            .downloaders
            .fetch(descriptor, &output_dir, nexus, Some(progress))
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("{} failed: {}", descriptor.key, e);
                on_event(AcquisitionEvent::Message(format!("{}: {}", descriptor.key, e)));
                return Ok(DownloadOutcome::failed(
                    &descriptor.key,
                    e.to_string(),
                    e.is_premium_required(),
                ));
            }
        };

        let target = self.presence.expected_path(descriptor);
        match archive::normalize(&fetched.path, &target, descriptor.flatten) {
            Ok(result) => {
                debug!("{}: {:?}", descriptor.key, result);
                Ok(DownloadOutcome {
                    key: descriptor.key.clone(),
                    bytes: fetched.bytes,
                    total: fetched.total,
                    path: Some(target),
                    result: AssetResult::Fetched,
                })
            }
            Err(e) => {
                warn!("{} downloaded but could not be placed: {}", descriptor.key, e);
                Ok(DownloadOutcome::failed(&descriptor.key, e.to_string(), false))
            }
        }
    }

    /// Assets of `game` not on disk
    pub fn missing_assets(&self, game: &str) -> Vec<&AssetDescriptor> {
        self.catalog
            .for_game(game)
            .into_iter()
            .filter(|d| !self.presence.is_present(d))
            .collect()
    }

    pub fn manual_instructions(&self, game: &str) -> Vec<ManualInstruction> {
        self.missing_assets(game)
            .into_iter()
            .map(|d| ManualInstruction {
                key: d.key.clone(),
                url: d.manual_url(),
                file_name: d.file_name.clone(),
                target_dir: self.presence.output_dir(d),
                hint: d.manual_hint(),
                description: d.description.clone(),
            })
            .collect()
    }

    /// Printable guide for everything still missing
    pub fn manual_guide(&self, game: &str) -> String {
        let instructions = self.manual_instructions(game);
        if instructions.is_empty() {
            return format!("All assets for {} are present.\n", game);
        }

        let title = format!("MANUAL DOWNLOAD GUIDE FOR {}", game.to_uppercase());
        let mut guide = format!("{}\n{}\n\n", title, "=".repeat(title.len()));
        guide.push_str("Please download the following files manually:\n\n");
        for (i, step) in instructions.iter().enumerate() {
            guide.push_str(&format!("{}. {}\n", i + 1, step.key));
            guide.push_str(&format!("   URL: {}\n", step.url));
            guide.push_str(&format!("   {}\n", step.hint));
            guide.push_str(&format!("   Save as: {}\n", step.file_name));
            guide.push_str(&format!("   Location: {}\n", step.target_dir.display()));
            if !step.description.is_empty() {
                guide.push_str(&format!("   Description: {}\n", step.description));
            }
            guide.push('\n');
        }
        guide.push_str("Notes:\n");
        guide.push_str("- Vendor file names are fine; they are recognized and renamed.\n");
        guide.push_str("- Download the newest version of each file.\n");
        guide.push_str("- Run the check again after downloading.\n");
        guide
    }

    /// Open the page of each missing asset, once per URL. Returns how many opened.
    pub async fn open_manual_sources(&self, game: &str) -> usize {
        let mut seen = HashSet::new();
        let mut opened = 0;
        for step in self.manual_instructions(game) {
            if !seen.insert(step.url.clone()) {
                continue;
            }
            if opened > 0 {
                tokio::time::sleep(self.open_delay).await;
            }
            match self.opener.open(&step.url) {
                Ok(()) => opened += 1,
                Err(e) => warn!("Could not open {}: {}", step.url, e),
            }
        }
        opened
    }

    /// Rename and normalize files the user downloaded by hand
    pub fn normalize_existing(&self, game: &str) -> Vec<(String, NormalizeResult)> {
        let descriptors = self.catalog.for_game(game);
        let canonical: HashSet<PathBuf> = descriptors
            .iter()
            .map(|d| self.presence.expected_path(d))
            .collect();

        let mut results = Vec::new();
        for descriptor in descriptors {
            let Some(found) = self.presence.locate_download(descriptor) else {
                continue;
            };
            let target = self.presence.expected_path(descriptor);
            // A sibling's canonical file is never a candidate
            if found != target && canonical.contains(&found) {
                continue;
            }
            if found == target && !descriptor.flatten {
                continue;
            }
            match archive::normalize(&found, &target, descriptor.flatten) {
                Ok(result) => results.push((descriptor.key.clone(), result)),
                Err(e) => warn!("Could not normalize {}: {}", found.display(), e),
            }
        }
        results
    }

    /// Installer entry point: whether every asset is on disk, with absolute paths
    pub fn ensure_assets_present(&self, game: &str) -> (bool, BTreeMap<String, PathBuf>) {
        let mut ready = true;
        let mut found = BTreeMap::new();
        for descriptor in self.catalog.for_game(game) {
            match self.presence.find(descriptor) {
                Some(path) => {
                    found.insert(descriptor.key.clone(), absolute(&path));
                }
                None => ready = false,
            }
        }
        (ready, found)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
