//! Skill lookup. The engine only reads skills; where they come from is up to the caller.

use std::path::Path;

use dashmap::DashMap;
use serde::Deserialize;

use skillrun_core::{Skill, SkillId};

pub trait SkillCatalog: Send + Sync {
    fn get(&self, id: &SkillId) -> Option<Skill>;
    fn list(&self) -> Vec<Skill>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Default)]
pub struct InMemorySkillCatalog {
    skills: DashMap<SkillId, Skill>,
}

/// A skills file holds either one skill or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum SkillsFile {
    Many(Vec<Skill>),
    One(Box<Skill>),
}

impl InMemorySkillCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_skills(skills: impl IntoIterator<Item = Skill>) -> Self {
        let catalog = Self::new();
        for skill in skills {
            catalog.insert(skill);
        }
        catalog
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let skills = match serde_json::from_str::<SkillsFile>(json)? {
            SkillsFile::Many(skills) => skills,
            SkillsFile::One(skill) => vec![*skill],
        };
        Ok(Self::from_skills(skills))
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn insert(&self, skill: Skill) {
        let _ = self.skills.insert(skill.id.clone(), skill);
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

impl SkillCatalog for InMemorySkillCatalog {
    fn get(&self, id: &SkillId) -> Option<Skill> {
        self.skills.get(id).map(|s| s.value().clone())
    }

    fn list(&self) -> Vec<Skill> {
        let mut skills: Vec<Skill> = self.skills.iter().map(|s| s.value().clone()).collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }
}
