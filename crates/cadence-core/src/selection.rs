//! Track selection
//!
//! Selections are stored as intents keyed by a representation `Fingerprint`
//! rather than by catalog-local ids, so a choice made against one catalog
//! re-applies to a structurally similar catalog after a source swap.
//! Tables published by the adapters of the current source are re-validated
//! whenever they change, when a representation is excluded, or when a new
//! catalog arrives.

use crate::{
    config::SelectionPreferences,
    types::{AdapterKind, Representation, RepresentationId, StreamCatalog, TrackType},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Selection key stable across catalogs of the same logical content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub track_type: TrackType,
    /// Codec family without profile/level ("avc1", "mp4a")
    pub codec_family: Option<String>,
    pub bitrate: u64,
    /// Lowercased language tag
    pub language: Option<String>,
}

impl Fingerprint {
    pub fn of(rep: &Representation) -> Self {
        Self {
            track_type: rep.track_type,
            codec_family: rep.codec_family(),
            bitrate: rep.bitrate,
            language: rep.language.as_ref().map(|l| l.to_lowercase()),
        }
    }

    pub fn matches(&self, rep: &Representation) -> bool {
        *self == Self::of(rep)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.track_type,
            self.codec_family.as_deref().unwrap_or("-"),
            self.bitrate,
            self.language.as_deref().unwrap_or("-")
        )
    }
}

/// Representations published by one adapter of the current source
#[derive(Debug, Clone, PartialEq)]
pub struct TrackTable {
    pub adapter: AdapterKind,
    pub representations: Vec<Representation>,
}

impl TrackTable {
    pub fn new(adapter: AdapterKind, representations: Vec<Representation>) -> Self {
        Self {
            adapter,
            representations,
        }
    }

    pub fn offers(&self, track_type: TrackType) -> bool {
        self.representations.iter().any(|r| r.track_type == track_type)
    }
}

/// A resolved selection that changed
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionChange {
    pub track_type: TrackType,
    /// `None` when the track type is now unselected
    pub representation: Option<Representation>,
}

/// Receives every change of the resolved selection
pub trait TrackSelectionListener: Send + Sync {
    fn on_selection_changed(&self, change: &SelectionChange);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Intent {
    Prefer(Fingerprint),
    /// Subtitle "none"
    Disabled,
}

/// Owns the per-type selection of one session
pub struct TrackSelectionManager {
    preferences: SelectionPreferences,
    intents: HashMap<TrackType, Intent>,
    resolved: HashMap<TrackType, (AdapterKind, Representation)>,
    /// Adapters of the current source, primary first
    adapters: Vec<AdapterKind>,
    tables: Vec<TrackTable>,
    exclusions: HashMap<AdapterKind, HashMap<RepresentationId, Instant>>,
    listener: Option<Arc<dyn TrackSelectionListener>>,
}

impl TrackSelectionManager {
    pub fn new(preferences: SelectionPreferences) -> Self {
        Self {
            preferences,
            intents: HashMap::new(),
            resolved: HashMap::new(),
            adapters: Vec::new(),
            tables: Vec::new(),
            exclusions: HashMap::new(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TrackSelectionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn set_listener(&mut self, listener: Arc<dyn TrackSelectionListener>) {
        self.listener = Some(listener);
    }

    /// Seed an intent from persisted preferences
    pub fn restore(&mut self, track_type: TrackType, fingerprint: Fingerprint) -> Result<Vec<SelectionChange>> {
        if fingerprint.track_type != track_type {
            return Err(Error::SelectionUnavailable(format!(
                "fingerprint {} is not a {} track",
                fingerprint, track_type
            )));
        }
        self.intents.insert(track_type, Intent::Prefer(fingerprint));
        self.revalidate()
    }

    /// Explicit intent for a track type, if one was made
    pub fn intent(&self, track_type: TrackType) -> Option<&Fingerprint> {
        match self.intents.get(&track_type) {
            Some(Intent::Prefer(fp)) => Some(fp),
            _ => None,
        }
    }

    /// Select a representation by id from the current tables
    pub fn select_track(
        &mut self,
        track_type: TrackType,
        id: &RepresentationId,
    ) -> Result<Option<SelectionChange>> {
        let (adapter, rep) = self
            .tables
            .iter()
            .find_map(|t| {
                t.representations
                    .iter()
                    .find(|r| &r.id == id)
                    .map(|r| (t.adapter, r.clone()))
            })
            .ok_or_else(|| Error::SelectionUnavailable(format!("unknown representation {}", id)))?;

        if rep.track_type != track_type {
            return Err(Error::SelectionUnavailable(format!(
                "{} is a {} track, not {}",
                id, rep.track_type, track_type
            )));
        }

        let fingerprint = Fingerprint::of(&rep);
        if self.is_merged() {
            let one_sided = self
                .tables
                .iter()
                .filter(|t| t.offers(track_type))
                .any(|t| !t.representations.iter().any(|r| fingerprint.matches(r)));
            if one_sided {
                return Err(Error::SelectionUnavailable(format!(
                    "{} exists in only one adapter of the merged source",
                    id
                )));
            }
        }

        if self.is_excluded(adapter, id) {
            return Err(Error::SelectionUnavailable(format!(
                "{} is temporarily excluded",
                id
            )));
        }

        info!(track = %track_type, id = %id, fingerprint = %fingerprint, "Track selected");
        self.intents.insert(track_type, Intent::Prefer(fingerprint));
        Ok(self.set_resolved(track_type, Some((adapter, rep))))
    }

    /// Select "none"; only subtitles may be disabled
    pub fn disable(&mut self, track_type: TrackType) -> Result<Option<SelectionChange>> {
        if track_type.is_required() {
            return Err(Error::SelectionUnavailable(format!(
                "{} track cannot be disabled",
                track_type
            )));
        }
        self.intents.insert(track_type, Intent::Disabled);
        Ok(self.set_resolved(track_type, None))
    }

    pub fn get_selection(&self, track_type: TrackType) -> Option<RepresentationId> {
        self.selected(track_type).map(|r| r.id.clone())
    }

    pub fn selected(&self, track_type: TrackType) -> Option<&Representation> {
        self.resolved.get(&track_type).map(|(_, rep)| rep)
    }

    /// The representation an adapter must load for a track type
    pub fn selection_for(&self, adapter: AdapterKind, track_type: TrackType) -> Option<&Representation> {
        let (resolved_adapter, resolved) = self.resolved.get(&track_type)?;
        if *resolved_adapter == adapter {
            return Some(resolved);
        }
        let fingerprint = Fingerprint::of(resolved);
        self.tables
            .iter()
            .find(|t| t.adapter == adapter)?
            .representations
            .iter()
            .find(|r| fingerprint.matches(r) && !self.is_excluded(adapter, &r.id))
    }

    pub fn is_merged(&self) -> bool {
        self.adapters.len() > 1 || self.tables.len() > 1
    }

    pub fn tables(&self) -> &[TrackTable] {
        &self.tables
    }

    /// Reset tables and exclusions for a new catalog; intents survive
    pub fn on_catalog_changed(&mut self, catalog: &StreamCatalog) -> Result<Vec<SelectionChange>> {
        self.tables.clear();
        self.adapters.clear();
        self.exclusions.clear();

        if !catalog.representations.is_empty() {
            let adapter = catalog.protocol_hint.unwrap_or(AdapterKind::Progressive);
            self.tables
                .push(TrackTable::new(adapter, catalog.representations.clone()));
        }

        debug!(
            representations = catalog.representations.len(),
            "Catalog changed"
        );
        self.revalidate()
    }

    /// Declare the adapters of the current source, primary first.
    /// Tables of adapters outside the source are dropped.
    pub fn bind_adapters(&mut self, adapters: Vec<AdapterKind>) {
        self.tables.retain(|t| adapters.contains(&t.adapter));
        self.adapters = adapters;
        self.sort_tables();
    }

    /// Forget an adapter that stopped serving the current source
    pub fn remove_track_table(&mut self, adapter: AdapterKind) -> Result<Vec<SelectionChange>> {
        self.tables.retain(|t| t.adapter != adapter);
        self.adapters.retain(|a| *a != adapter);
        self.exclusions.remove(&adapter);
        if self.resolved.values().any(|(a, _)| *a == adapter) {
            // Resolutions on the removed adapter are re-chosen on the remaining tables
            self.resolved.retain(|_, (a, _)| *a != adapter);
        }
        self.revalidate()
    }

    /// Install or replace the table published by one adapter
    pub fn update_track_table(&mut self, table: TrackTable) -> Result<Vec<SelectionChange>> {
        match self.tables.iter_mut().find(|t| t.adapter == table.adapter) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
        self.sort_tables();
        self.revalidate()
    }

    /// Drop a representation from consideration for a cooldown
    pub fn exclude(&mut self, adapter: AdapterKind, id: &RepresentationId, duration: Duration) {
        debug!(adapter = %adapter, id = %id, duration_ms = duration.as_millis() as u64, "Representation excluded");
        self.exclusions
            .entry(adapter)
            .or_default()
            .insert(id.clone(), Instant::now() + duration);
    }

    pub fn is_excluded(&self, adapter: AdapterKind, id: &RepresentationId) -> bool {
        self.exclusions
            .get(&adapter)
            .and_then(|m| m.get(id))
            .is_some_and(|until| *until > Instant::now())
    }

    /// Currently excluded representations
    pub fn excluded(&self) -> Vec<(AdapterKind, RepresentationId)> {
        let now = Instant::now();
        let mut excluded: Vec<_> = self
            .exclusions
            .iter()
            .flat_map(|(adapter, ids)| {
                ids.iter()
                    .filter(move |(_, until)| **until > now)
                    .map(move |(id, _)| (*adapter, id.clone()))
            })
            .collect();
        excluded.sort();
        excluded
    }

    /// True when any table offers the track type
    pub fn offers(&self, track_type: TrackType) -> bool {
        self.tables.iter().any(|t| t.offers(track_type))
    }

    /// Selectable representations of a track type
    pub fn available(&self, track_type: TrackType) -> Vec<&Representation> {
        self.candidates(track_type).into_iter().map(|(_, r)| r).collect()
    }

    /// Re-resolve every track type against the current tables and exclusions
    pub fn revalidate(&mut self) -> Result<Vec<SelectionChange>> {
        if self.tables.is_empty() {
            return Ok(Vec::new());
        }

        let mut next = Vec::with_capacity(TrackType::ALL.len());
        for track_type in TrackType::ALL {
            if !self.offers(track_type) {
                next.push((track_type, None));
                continue;
            }
            let candidates = self.candidates(track_type);
            if candidates.is_empty() {
                if track_type.is_required() {
                    return Err(Error::AllRepresentationsExcluded { track_type });
                }
                next.push((track_type, None));
                continue;
            }
            let choice = self
                .choose(track_type, &candidates)
                .map(|(adapter, rep)| (adapter, rep.clone()));
            next.push((track_type, choice));
        }

        Ok(next
            .into_iter()
            .filter_map(|(track_type, choice)| self.set_resolved(track_type, choice))
            .collect())
    }

    fn sort_tables(&mut self) {
        let adapters = &self.adapters;
        self.tables.sort_by_key(|t| {
            adapters
                .iter()
                .position(|a| *a == t.adapter)
                .unwrap_or(usize::MAX)
        });
    }

    /// Non-excluded representations, restricted to fingerprints shared by all
    /// offering tables of a merged source; when nothing is shared, the first
    /// offering table decides alone
    fn candidates(&self, track_type: TrackType) -> Vec<(AdapterKind, &Representation)> {
        let per_table: Vec<(AdapterKind, Vec<&Representation>)> = self
            .tables
            .iter()
            .filter(|t| t.offers(track_type))
            .map(|t| {
                let reps = t
                    .representations
                    .iter()
                    .filter(|r| r.track_type == track_type && !self.is_excluded(t.adapter, &r.id))
                    .collect();
                (t.adapter, reps)
            })
            .collect();

        if let Some(((first_adapter, first), rest)) = per_table.split_first() {
            if !rest.is_empty() {
                let shared: Vec<_> = first
                    .iter()
                    .filter(|r| {
                        let fp = Fingerprint::of(r);
                        rest.iter().all(|(_, reps)| reps.iter().any(|o| fp.matches(o)))
                    })
                    .map(|r| (*first_adapter, *r))
                    .collect();
                if !shared.is_empty() {
                    return shared;
                }
            }
        }

        per_table
            .into_iter()
            .find(|(_, reps)| !reps.is_empty())
            .map(|(adapter, reps)| reps.into_iter().map(|r| (adapter, r)).collect())
            .unwrap_or_default()
    }

    fn choose<'a>(
        &self,
        track_type: TrackType,
        candidates: &[(AdapterKind, &'a Representation)],
    ) -> Option<(AdapterKind, &'a Representation)> {
        // The previous resolution acts as the intent when none was made explicitly
        let target = match self.intents.get(&track_type) {
            Some(Intent::Disabled) => return None,
            Some(Intent::Prefer(fp)) => Some(fp.clone()),
            None => self.resolved.get(&track_type).map(|(_, r)| Fingerprint::of(r)),
        };

        let Some(target) = target else {
            return self.default_choice(track_type, candidates);
        };

        if let Some(exact) = candidates.iter().find(|(_, r)| target.matches(r)) {
            return Some(*exact);
        }

        match track_type {
            TrackType::Video => closest_bitrate(candidates.iter().copied(), target.bitrate),
            TrackType::Audio => {
                let same_language = candidates.iter().copied().filter(|(_, r)| {
                    r.language.as_ref().map(|l| l.to_lowercase()) == target.language
                });
                closest_bitrate(same_language, target.bitrate)
                    .or_else(|| self.default_choice(track_type, candidates))
            }
            TrackType::Subtitle => None,
        }
    }

    fn default_choice<'a>(
        &self,
        track_type: TrackType,
        candidates: &[(AdapterKind, &'a Representation)],
    ) -> Option<(AdapterKind, &'a Representation)> {
        match track_type {
            TrackType::Video => {
                let capped = candidates
                    .iter()
                    .copied()
                    .filter(|(_, r)| self.preferences.max_video_bitrate.map_or(true, |max| r.bitrate <= max))
                    .max_by_key(|(_, r)| r.bitrate);
                // Nothing under the cap: the lightest one
                capped.or_else(|| candidates.iter().copied().min_by_key(|(_, r)| r.bitrate))
            }
            TrackType::Audio => {
                let preferred = self.preferences.preferred_audio_language.as_deref().and_then(|lang| {
                    candidates
                        .iter()
                        .copied()
                        .filter(|(_, r)| {
                            r.language
                                .as_deref()
                                .is_some_and(|l| l.eq_ignore_ascii_case(lang))
                        })
                        .max_by_key(|(_, r)| r.bitrate)
                });
                preferred.or_else(|| candidates.iter().copied().max_by_key(|(_, r)| r.bitrate))
            }
            TrackType::Subtitle => None,
        }
    }

    fn set_resolved(
        &mut self,
        track_type: TrackType,
        choice: Option<(AdapterKind, Representation)>,
    ) -> Option<SelectionChange> {
        let unchanged = match (self.resolved.get(&track_type), &choice) {
            (Some((a, prev)), Some((b, next))) => a == b && prev.id == next.id,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return None;
        }

        let representation = match choice {
            Some((adapter, rep)) => {
                self.resolved.insert(track_type, (adapter, rep.clone()));
                Some(rep)
            }
            None => {
                self.resolved.remove(&track_type);
                None
            }
        };

        let change = SelectionChange {
            track_type,
            representation,
        };
        debug!(
            track = %track_type,
            id = ?change.representation.as_ref().map(|r| r.id.as_str()),
            "Selection changed"
        );
        if let Some(listener) = &self.listener {
            listener.on_selection_changed(&change);
        }
        Some(change)
    }
}

impl std::fmt::Debug for TrackSelectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackSelectionManager")
            .field("intents", &self.intents)
            .field("resolved", &self.resolved)
            .field("adapters", &self.adapters)
            .field("tables", &self.tables.len())
            .finish()
    }
}

/// Closest bitrate; ties go to the higher one
fn closest_bitrate<'a>(
    candidates: impl Iterator<Item = (AdapterKind, &'a Representation)>,
    target: u64,
) -> Option<(AdapterKind, &'a Representation)> {
    candidates.min_by_key(|(_, r)| (r.bitrate.abs_diff(target), std::cmp::Reverse(r.bitrate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;
    use std::sync::Mutex;

    fn video(id: &str, bitrate: u64, height: u32) -> Representation {
        Representation::video(id, bitrate, Resolution::new(height * 16 / 9, height)).with_codec("avc1.640028")
    }

    fn audio(id: &str, bitrate: u64, lang: &str) -> Representation {
        Representation::audio(id, bitrate, lang).with_codec("mp4a.40.2")
    }

    fn catalog(reps: Vec<Representation>) -> StreamCatalog {
        StreamCatalog::from_representations(reps)
    }

    fn trailer() -> StreamCatalog {
        catalog(vec![
            video("t-v1", 800_000, 360),
            video("t-v2", 2_500_000, 720),
            video("t-v3", 5_000_000, 1080),
            audio("t-a-en", 128_000, "en"),
            audio("t-a-de", 128_000, "de"),
            Representation::subtitle("t-s-en", "en"),
        ])
    }

    fn feature() -> StreamCatalog {
        catalog(vec![
            video("f-v1", 800_000, 360),
            video("f-v2", 2_500_000, 720),
            video("f-v3", 5_000_000, 1080),
            audio("f-a-en", 128_000, "EN"),
            audio("f-a-de", 128_000, "de"),
        ])
    }

    #[test]
    fn test_defaults() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        assert_eq!(manager.get_selection(TrackType::Video), Some("t-v3".into()));
        assert!(manager.get_selection(TrackType::Audio).is_some());
        assert_eq!(manager.get_selection(TrackType::Subtitle), None);
    }

    #[test]
    fn test_preferences() {
        let prefs = SelectionPreferences {
            preferred_audio_language: Some("de".into()),
            max_video_bitrate: Some(3_000_000),
        };
        let mut manager = TrackSelectionManager::new(prefs);
        manager.on_catalog_changed(&trailer()).unwrap();
        assert_eq!(manager.get_selection(TrackType::Video), Some("t-v2".into()));
        assert_eq!(manager.get_selection(TrackType::Audio), Some("t-a-de".into()));
    }

    #[test]
    fn test_fingerprint_round_trip_across_catalogs() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        manager.select_track(TrackType::Video, &"t-v2".into()).unwrap();
        manager.select_track(TrackType::Audio, &"t-a-en".into()).unwrap();

        manager.on_catalog_changed(&feature()).unwrap();
        assert_eq!(manager.get_selection(TrackType::Video), Some("f-v2".into()));
        // Language compared case-insensitively
        assert_eq!(manager.get_selection(TrackType::Audio), Some("f-a-en".into()));
    }

    #[test]
    fn test_fallback_without_exact_match() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        manager.select_track(TrackType::Video, &"t-v2".into()).unwrap();
        manager.select_track(TrackType::Audio, &"t-a-de".into()).unwrap();
        manager.select_track(TrackType::Subtitle, &"t-s-en".into()).unwrap();

        let other = catalog(vec![
            video("o-v1", 1_000_000, 480),
            video("o-v2", 3_000_000, 720),
            audio("o-a-en", 96_000, "en"),
            audio("o-a-de", 256_000, "de").with_codec("ec-3"),
            Representation::subtitle("o-s-fr", "fr"),
        ]);
        manager.on_catalog_changed(&other).unwrap();
        assert_eq!(manager.get_selection(TrackType::Video), Some("o-v2".into()));
        assert_eq!(manager.get_selection(TrackType::Audio), Some("o-a-de".into()));
        assert_eq!(manager.get_selection(TrackType::Subtitle), None);
    }

    #[test]
    fn test_restore_before_catalog() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        let fp = Fingerprint::of(&video("x", 2_500_000, 720));
        assert!(manager.restore(TrackType::Video, fp.clone()).unwrap().is_empty());
        assert!(manager.restore(TrackType::Audio, fp).is_err());

        manager.on_catalog_changed(&feature()).unwrap();
        assert_eq!(manager.get_selection(TrackType::Video), Some("f-v2".into()));
    }

    #[test]
    fn test_disable() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        manager.select_track(TrackType::Subtitle, &"t-s-en".into()).unwrap();
        let change = manager.disable(TrackType::Subtitle).unwrap().unwrap();
        assert_eq!(change.representation, None);
        assert!(matches!(
            manager.disable(TrackType::Video),
            Err(Error::SelectionUnavailable(_))
        ));
    }

    #[test]
    fn test_invalid_selection() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        assert!(matches!(
            manager.select_track(TrackType::Video, &"missing".into()),
            Err(Error::SelectionUnavailable(_))
        ));
        assert!(matches!(
            manager.select_track(TrackType::Video, &"t-a-en".into()),
            Err(Error::SelectionUnavailable(_))
        ));
    }

    #[test]
    fn test_exclusion_picks_closest_alternate() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        assert_eq!(manager.get_selection(TrackType::Video), Some("t-v3".into()));

        manager.exclude(AdapterKind::Progressive, &"t-v3".into(), Duration::from_secs(60));
        assert!(manager.is_excluded(AdapterKind::Progressive, &"t-v3".into()));
        let changes = manager.revalidate().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(manager.get_selection(TrackType::Video), Some("t-v2".into()));
        assert_eq!(manager.available(TrackType::Video).len(), 2);
        assert_eq!(
            manager.excluded(),
            vec![(AdapterKind::Progressive, RepresentationId::from("t-v3"))]
        );

        // Excluded representations cannot be selected explicitly
        assert!(manager.select_track(TrackType::Video, &"t-v3".into()).is_err());
    }

    #[test]
    fn test_all_required_excluded() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager
            .on_catalog_changed(&catalog(vec![video("only", 1_000_000, 720)]))
            .unwrap();
        manager.exclude(AdapterKind::Progressive, &"only".into(), Duration::from_secs(60));
        assert!(matches!(
            manager.revalidate(),
            Err(Error::AllRepresentationsExcluded { track_type: TrackType::Video })
        ));
        // Nothing was applied
        assert_eq!(manager.get_selection(TrackType::Video), Some("only".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusion_expires() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        manager.exclude(AdapterKind::Progressive, &"t-v3".into(), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!manager.is_excluded(AdapterKind::Progressive, &"t-v3".into()));
    }

    #[test]
    fn test_catalog_swap_clears_exclusions() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        manager.exclude(AdapterKind::Progressive, &"t-v3".into(), Duration::from_secs(60));
        manager.on_catalog_changed(&trailer()).unwrap();
        assert!(manager.excluded().is_empty());
    }

    fn merged_manager() -> TrackSelectionManager {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&StreamCatalog::new()).unwrap();
        manager.bind_adapters(vec![AdapterKind::Dash, AdapterKind::Hls]);
        manager
            .update_track_table(TrackTable::new(
                AdapterKind::Hls,
                vec![video("variant_0", 2_500_000, 720), video("variant_1", 800_000, 360)],
            ))
            .unwrap();
        manager
            .update_track_table(TrackTable::new(
                AdapterKind::Dash,
                vec![
                    video("d-720", 2_500_000, 720),
                    video("d-1080", 5_000_000, 1080),
                    video("d-360", 800_000, 360),
                ],
            ))
            .unwrap();
        manager
    }

    #[test]
    fn test_merged_selection_is_mirrored() {
        let mut manager = merged_manager();
        assert!(manager.is_merged());
        assert_eq!(manager.tables()[0].adapter, AdapterKind::Dash);

        // Automatic choice only among shared fingerprints
        assert_eq!(manager.get_selection(TrackType::Video), Some("d-720".into()));

        manager.select_track(TrackType::Video, &"variant_1".into()).unwrap();
        assert_eq!(
            manager.selection_for(AdapterKind::Dash, TrackType::Video).map(|r| r.id.as_str()),
            Some("d-360")
        );
        assert_eq!(
            manager.selection_for(AdapterKind::Hls, TrackType::Video).map(|r| r.id.as_str()),
            Some("variant_1")
        );

        assert!(matches!(
            manager.select_track(TrackType::Video, &"d-1080".into()),
            Err(Error::SelectionUnavailable(_))
        ));
    }

    #[test]
    fn test_removed_adapter_hands_over() {
        let mut manager = merged_manager();
        manager.select_track(TrackType::Video, &"d-360".into()).unwrap();
        manager.remove_track_table(AdapterKind::Dash).unwrap();
        assert!(!manager.is_merged());
        assert_eq!(manager.get_selection(TrackType::Video), Some("variant_1".into()));
        assert_eq!(manager.selection_for(AdapterKind::Dash, TrackType::Video), None);
    }

    #[test]
    fn test_bind_drops_foreign_tables() {
        let mut manager = TrackSelectionManager::new(SelectionPreferences::default());
        manager.on_catalog_changed(&trailer()).unwrap();
        manager.bind_adapters(vec![AdapterKind::Dash]);
        assert!(manager.tables().is_empty());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(TrackType, Option<String>)>>);

    impl TrackSelectionListener for Recorder {
        fn on_selection_changed(&self, change: &SelectionChange) {
            self.0.lock().unwrap().push((
                change.track_type,
                change.representation.as_ref().map(|r| r.id.0.clone()),
            ));
        }
    }

    #[test]
    fn test_listener_notified_on_change_only() {
        let recorder = Arc::new(Recorder::default());
        let mut manager =
            TrackSelectionManager::new(SelectionPreferences::default()).with_listener(recorder.clone());
        manager.on_catalog_changed(&trailer()).unwrap();
        let initial = recorder.0.lock().unwrap().len();
        assert_eq!(initial, 2);

        manager.revalidate().unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), initial);

        manager.select_track(TrackType::Video, &"t-v1".into()).unwrap();
        assert_eq!(
            recorder.0.lock().unwrap().last().cloned(),
            Some((TrackType::Video, Some("t-v1".to_string())))
        );
    }
}
