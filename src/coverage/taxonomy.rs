//! ATT&CK-style taxonomy arena.
//!
//! Tactics and techniques live in flat vectors and reference each other by
//! index. A technique may belong to several tactics but is stored once;
//! sub-techniques are separate nodes pointing at their parent and inherit
//! the parent's tactics.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, TideError};

pub type TacticIdx = usize;
pub type TechniqueIdx = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct TacticNode {
    pub id: String,
    pub name: String,
    /// Slug such as `defense-evasion`.
    pub shortname: String,
    /// Member techniques and sub-techniques in insertion order.
    pub techniques: Vec<TechniqueIdx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TechniqueNode {
    pub id: String,
    pub name: String,
    pub parent: Option<TechniqueIdx>,
    pub tactics: Vec<TacticIdx>,
    pub children: Vec<TechniqueIdx>,
}

impl TechniqueNode {
    pub fn is_subtechnique(&self) -> bool {
        self.parent.is_some()
    }
}

/// Normalised technique or tactic identifier.
pub(crate) fn normalize_id(id: &str) -> String {
    id.trim().to_ascii_uppercase()
}

/// Tactic/technique/sub-technique forest.
///
/// # Examples
///
/// ```rust
/// use tide_engine::coverage::Taxonomy;
///
/// let mut taxonomy = Taxonomy::new();
/// taxonomy.add_tactic("TA0006", "Credential Access", "credential-access")?;
/// taxonomy.add_technique("T1003", "OS Credential Dumping", &["TA0006"])?;
/// taxonomy.add_subtechnique("T1003.001", "LSASS Memory", "T1003")?;
///
/// assert_eq!(taxonomy.technique_count(), 2);
/// assert_eq!(taxonomy.tactics()[0].techniques.len(), 2);
/// # Ok::<(), tide_engine::TideError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Taxonomy {
    tactics: Vec<TacticNode>,
    techniques: Vec<TechniqueNode>,
    tactic_index: HashMap<String, TacticIdx>,
    shortname_index: HashMap<String, TacticIdx>,
    technique_index: HashMap<String, TechniqueIdx>,
}

impl Taxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tactic(&mut self, id: &str, name: &str, shortname: &str) -> Result<TacticIdx> {
        let id = normalize_id(id);
        let shortname = shortname.trim().to_ascii_lowercase();
        if id.is_empty() {
            return Err(TideError::InvalidTaxonomy("tactic with empty id".to_string()));
        }
        if self.tactic_index.contains_key(&id) {
            return Err(TideError::InvalidTaxonomy(format!("duplicate tactic '{id}'")));
        }
        if self.shortname_index.contains_key(&shortname) {
            return Err(TideError::InvalidTaxonomy(format!(
                "duplicate tactic shortname '{shortname}'"
            )));
        }

        let idx = self.tactics.len();
        self.tactics.push(TacticNode {
            id: id.clone(),
            name: name.trim().to_string(),
            shortname: shortname.clone(),
            techniques: Vec::new(),
        });
        self.tactic_index.insert(id, idx);
        if !shortname.is_empty() {
            self.shortname_index.insert(shortname, idx);
        }
        Ok(idx)
    }

    /// Add a top-level technique under one or more tactics (by id or
    /// shortname). Adding an existing technique again merges the tactics.
    pub fn add_technique(&mut self, id: &str, name: &str, tactics: &[&str]) -> Result<TechniqueIdx> {
        let id = normalize_id(id);
        if id.is_empty() {
            return Err(TideError::InvalidTaxonomy("technique with empty id".to_string()));
        }
        let tactic_indices = tactics
            .iter()
            .map(|t| {
                self.tactic_idx(t)
                    .ok_or_else(|| TideError::InvalidTaxonomy(format!("technique '{id}' references unknown tactic '{t}'")))
            })
            .collect::<Result<Vec<_>>>()?;

        let idx = match self.technique_index.get(&id).copied() {
            Some(existing) if self.techniques[existing].is_subtechnique() => {
                return Err(TideError::InvalidTaxonomy(format!(
                    "'{id}' is already defined as a sub-technique"
                )));
            }
            Some(existing) => existing,
            None => {
                let idx = self.techniques.len();
                self.techniques.push(TechniqueNode {
                    id: id.clone(),
                    name: name.trim().to_string(),
                    parent: None,
                    tactics: Vec::new(),
                    children: Vec::new(),
                });
                self.technique_index.insert(id, idx);
                idx
            }
        };

        for tactic in tactic_indices {
            self.attach(idx, tactic);
        }
        Ok(idx)
    }

    /// Add a sub-technique. Its id must extend the parent's (`T1003.001`
    /// under `T1003`); it inherits the parent's tactics.
    pub fn add_subtechnique(&mut self, id: &str, name: &str, parent: &str) -> Result<TechniqueIdx> {
        let id = normalize_id(id);
        let parent_id = normalize_id(parent);
        let parent_idx = match self.technique_index.get(&parent_id) {
            Some(&idx) if !self.techniques[idx].is_subtechnique() => idx,
            _ => {
                return Err(TideError::InvalidTaxonomy(format!(
                    "sub-technique '{id}' references unknown parent '{parent_id}'"
                )))
            }
        };
        if !id.starts_with(&format!("{parent_id}.")) || id.len() <= parent_id.len() + 1 {
            return Err(TideError::InvalidTaxonomy(format!(
                "sub-technique '{id}' does not extend parent '{parent_id}'"
            )));
        }

        if let Some(existing) = self.technique_index.get(&id).copied() {
            if self.techniques[existing].parent == Some(parent_idx) {
                return Ok(existing);
            }
            return Err(TideError::InvalidTaxonomy(format!("duplicate technique '{id}'")));
        }

        let idx = self.techniques.len();
        self.techniques.push(TechniqueNode {
            id: id.clone(),
            name: name.trim().to_string(),
            parent: Some(parent_idx),
            tactics: Vec::new(),
            children: Vec::new(),
        });
        self.technique_index.insert(id, idx);
        self.techniques[parent_idx].children.push(idx);

        let inherited = self.techniques[parent_idx].tactics.clone();
        for tactic in inherited {
            self.attach_one(idx, tactic);
        }
        Ok(idx)
    }

    /// Attach a technique and all its children to a tactic.
    fn attach(&mut self, technique: TechniqueIdx, tactic: TacticIdx) {
        self.attach_one(technique, tactic);
        let children = self.techniques[technique].children.clone();
        for child in children {
            self.attach_one(child, tactic);
        }
    }

    fn attach_one(&mut self, technique: TechniqueIdx, tactic: TacticIdx) {
        if !self.techniques[technique].tactics.contains(&tactic) {
            self.techniques[technique].tactics.push(tactic);
            self.tactics[tactic].techniques.push(technique);
        }
    }

    /// Look up a tactic by id, then by shortname.
    pub fn tactic_idx(&self, key: &str) -> Option<TacticIdx> {
        self.tactic_index
            .get(&normalize_id(key))
            .or_else(|| self.shortname_index.get(&key.trim().to_ascii_lowercase()))
            .copied()
    }

    pub fn technique_idx(&self, id: &str) -> Option<TechniqueIdx> {
        self.technique_index.get(&normalize_id(id)).copied()
    }

    pub fn technique(&self, id: &str) -> Option<&TechniqueNode> {
        self.technique_idx(id).map(|idx| &self.techniques[idx])
    }

    pub fn tactic(&self, idx: TacticIdx) -> &TacticNode {
        &self.tactics[idx]
    }

    pub fn technique_at(&self, idx: TechniqueIdx) -> &TechniqueNode {
        &self.techniques[idx]
    }

    pub fn tactics(&self) -> &[TacticNode] {
        &self.tactics
    }

    pub fn techniques(&self) -> &[TechniqueNode] {
        &self.techniques
    }

    /// Number of distinct techniques and sub-techniques.
    pub fn technique_count(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }

    /// Parse the nested tactic → technique → sub-technique document (YAML
    /// or JSON).
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: TaxonomyFile =
            serde_yaml::from_str(text).map_err(|e| TideError::InvalidTaxonomy(e.to_string()))?;

        let mut taxonomy = Taxonomy::new();
        for tactic in &file.tactics {
            let shortname = tactic
                .shortname
                .clone()
                .unwrap_or_else(|| tactic.name.trim().to_ascii_lowercase().replace(' ', "-"));
            taxonomy.add_tactic(&tactic.id, &tactic.name, &shortname)?;
        }
        for tactic in &file.tactics {
            for technique in &tactic.techniques {
                taxonomy.add_technique(&technique.id, &technique.name, &[tactic.id.as_str()])?;
                for sub in &technique.subtechniques {
                    taxonomy.add_subtechnique(&sub.id, &sub.name, &technique.id)?;
                }
            }
        }
        Ok(taxonomy)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }
}

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    tactics: Vec<TacticSpec>,
}

#[derive(Debug, Deserialize)]
struct TacticSpec {
    id: String,
    name: String,
    #[serde(default)]
    shortname: Option<String>,
    #[serde(default)]
    techniques: Vec<TechniqueSpec>,
}

#[derive(Debug, Deserialize)]
struct TechniqueSpec {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    subtechniques: Vec<SubtechniqueSpec>,
}

#[derive(Debug, Deserialize)]
struct SubtechniqueSpec {
    id: String,
    #[serde(default)]
    name: String,
}
