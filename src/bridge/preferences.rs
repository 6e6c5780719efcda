//! Preference reconciliation
//!
//! Every source of a module keeps its own live preference list. The store
//! persists those lists per module, pushes persisted values back into freshly
//! loaded sources, and folds the per-language variants of one setting into a
//! single [`UniquePreference`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

use super::source::SourceInterop;
use super::types::{KeyLanguage, SourcePreference, UniquePreference};
use crate::core::error::{BridgeError, Result};
use crate::core::folders::{read_json, write_json};

/// Languages that supply the representative preference first, in order
pub const LANGUAGE_FALLBACK_ORDER: [&str; 9] = ["en", "es", "fr", "de", "it", "pt", "ru", "ja", "zh"];

static PREFERENCE_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();

/// Process-wide lock guarding one preference file
fn file_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let locks = PREFERENCE_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    match locks.lock() {
        Ok(mut map) => map
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone(),
        // a poisoned registry still hands out a usable, if unshared, lock
        Err(_) => Arc::new(tokio::sync::Mutex::new(())),
    }
}

/// How a preference key is reduced to the base key shared by its language variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKeyRule {
    /// Strip a trailing `_<language>` only
    LanguageSuffix,
    /// Strip `_<language>`, otherwise cut at the last underscore when the cut
    /// tail is the language of another folded record
    LastUnderscoreFallback,
}

impl BaseKeyRule {
    /// `languages` lists the languages of every record folded together
    pub fn base_key<'a>(self, key: &'a str, language: &str, languages: &[&str]) -> &'a str {
        let suffix = format!("_{}", language);
        if let Some(stripped) = key.strip_suffix(suffix.as_str()) {
            return stripped;
        }
        match self {
            BaseKeyRule::LanguageSuffix => key,
            BaseKeyRule::LastUnderscoreFallback => match key.rfind('_') {
                Some(idx) if idx > 0 => {
                    let tail = &key[idx + 1..];
                    if tail != language && languages.contains(&tail) {
                        &key[..idx]
                    } else {
                        key
                    }
                }
                _ => key,
            },
        }
    }
}

/// Order records by the language fallback list, then alphabetically
pub fn sort_by_language_fallback(records: &mut [SourcePreference]) {
    records.sort_by(|a, b| {
        let rank = |language: &str| {
            LANGUAGE_FALLBACK_ORDER
                .iter()
                .position(|l| *l == language)
                .unwrap_or(usize::MAX)
        };
        rank(&a.language)
            .cmp(&rank(&b.language))
            .then_with(|| a.language.cmp(&b.language))
    });
}

/// Fold records into one preference per base key, keeping first-seen order.
///
/// Two keys of the same record never share a [`UniquePreference`]; a
/// colliding key keeps its own entry under its full key.
pub fn collapse(records: &[SourcePreference], rule: BaseKeyRule) -> Vec<UniquePreference> {
    let languages: Vec<&str> = records.iter().map(|r| r.language.as_str()).collect();
    let mut ordered: Vec<UniquePreference> = Vec::new();
    let mut owners: Vec<Vec<usize>> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for (position, record) in records.iter().enumerate() {
        for preference in &record.preferences {
            let member = KeyLanguage {
                key: preference.key.clone(),
                language: record.language.clone(),
            };

            let base = rule.base_key(&preference.key, &record.language, &languages);
            let slot = match by_key.get(base) {
                Some(&slot) if !owners[slot].contains(&position) => Some(slot),
                Some(_) if base != preference.key => by_key
                    .get(preference.key.as_str())
                    .copied()
                    .filter(|slot| !owners[*slot].contains(&position)),
                _ => None,
            };

            match slot {
                Some(slot) => {
                    ordered[slot].languages.push(member);
                    owners[slot].push(position);
                }
                None => {
                    let key = if by_key.contains_key(base) { preference.key.as_str() } else { base };
                    by_key.entry(key.to_string()).or_insert(ordered.len());
                    owners.push(vec![position]);
                    ordered.push(UniquePreference {
                        languages: vec![member],
                        preference: preference.clone(),
                    });
                }
            }
        }
    }

    ordered
}

/// Persisted preferences of one logical module
pub struct PreferenceStore {
    module: String,
    path: PathBuf,
    rule: BaseKeyRule,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl PreferenceStore {
    pub fn new(module: &str, path: PathBuf, rule: BaseKeyRule) -> Self {
        let lock = file_lock(&path);
        Self {
            module: module.to_string(),
            path,
            rule,
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconcile live and persisted preferences, then collapse them by base key
    pub async fn load(&self, sources: &[Arc<SourceInterop>]) -> Result<Vec<UniquePreference>> {
        let _guard = self.lock.lock().await;
        let mut records = self.sync(sources).await?;
        sort_by_language_fallback(&mut records);
        Ok(collapse(&records, self.rule))
    }

    /// Write edited values into the persisted records and push them to the live sources
    pub async fn save(&self, edited: &[UniquePreference], sources: &[Arc<SourceInterop>]) -> Result<()> {
        let _guard = self.lock.lock().await;

        let Some(mut records) = self.read().await? else {
            debug!(module = %self.module, "No persisted preferences, nothing to save");
            return Ok(());
        };

        let mut edits: HashMap<(&str, &str), &UniquePreference> = HashMap::new();
        for unique in edited {
            for member in &unique.languages {
                edits.insert((member.key.as_str(), member.language.as_str()), unique);
            }
        }

        let mut changed = 0usize;
        for record in records.iter_mut() {
            for preference in record.preferences.iter_mut() {
                let Some(unique) = edits.get(&(preference.key.as_str(), record.language.as_str())) else {
                    continue;
                };
                if preference.current_value != unique.preference.current_value {
                    preference.current_value = unique.preference.current_value.clone();
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            write_json(&self.path, &records).await?;
            info!(module = %self.module, changed, "Saved module preferences");
            self.sync(sources).await?;
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<SourcePreference>>> {
        read_json(&self.path).await
    }

    /// Caller holds the file lock
    async fn sync(&self, sources: &[Arc<SourceInterop>]) -> Result<Vec<SourcePreference>> {
        let mut records = self.read().await?.unwrap_or_default();
        let mut dirty = false;

        for source in sources {
            let live = source.get_preferences()?;
            let position = records
                .iter()
                .position(|r| r.source_id == source.id() && r.language == source.language());

            let Some(position) = position else {
                records.push(SourcePreference {
                    source_id: source.id(),
                    language: source.language().to_string(),
                    preferences: live,
                });
                dirty = true;
                continue;
            };

            let record = &mut records[position];
            for preference in live {
                match record.preferences.iter().find(|p| p.key == preference.key) {
                    None => {
                        record.preferences.push(preference);
                        record.preferences.sort_by_key(|p| p.index);
                        dirty = true;
                    }
                    Some(stored) if stored.current_value != preference.current_value => {
                        let value = stored.current_value.clone().unwrap_or_default();
                        if let Err(e) = source.set_preference_value(preference.index, &value) {
                            match e {
                                BridgeError::InvalidPreference(_) => warn!(
                                    module = %self.module,
                                    source_id = source.id(),
                                    key = %preference.key,
                                    error = %e,
                                    "Persisted preference value rejected"
                                ),
                                other => return Err(other),
                            }
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        if dirty {
            write_json(&self.path, &records).await?;
            debug!(module = %self.module, path = %self.path.display(), "Persisted new preferences");
        }
        Ok(records)
    }
}
