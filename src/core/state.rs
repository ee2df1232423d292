use crate::core::error::PlanError;
use crate::core::plan::{pending_numbers, EpisodePlan, EpisodePlanEntry};
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_GENRE: &str = "都市言情";
pub const PRESET_GENRES: [&str; 6] = ["武侠", "都市言情", "穿越", "科幻", "悬疑", "奇幻"];

/// Random opaque id for roster entries.
pub fn new_id() -> String {
    let mut rng = rand::rng();
    format!("{:016x}", rng.random::<u64>())
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: String,
    pub name: String,
    pub age: String,
    pub role: String,
    pub personality: String,
    pub appearance: String,
    #[serde(default)]
    pub visual_prompt: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    // Only true while a portrait call for this id is outstanding.
    #[serde(skip)]
    pub image_loading: bool,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub location: String,
    pub time_of_day: String,
    pub description: String,
    #[serde(default)]
    pub visual_prompt: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(skip)]
    pub image_loading: bool,
}

/// Partial edit of a character; `None` fields are left alone.
#[derive(Default, Clone, Debug)]
pub struct CharacterPatch {
    pub name: Option<String>,
    pub age: Option<String>,
    pub role: Option<String>,
    pub personality: Option<String>,
    pub appearance: Option<String>,
    pub visual_prompt: Option<String>,
}

#[derive(Default, Clone, Debug)]
pub struct ScenePatch {
    pub name: Option<String>,
    pub location: Option<String>,
    pub time_of_day: Option<String>,
    pub description: Option<String>,
    pub visual_prompt: Option<String>,
}

/// Something a portrait can be generated for.
pub trait Portrayable {
    fn id(&self) -> &str;
    fn image_loading(&self) -> bool;
    fn set_image_loading(&mut self, loading: bool);
    fn set_image_url(&mut self, url: String);
}

impl Portrayable for Character {
    fn id(&self) -> &str {
        &self.id
    }
    fn image_loading(&self) -> bool {
        self.image_loading
    }
    fn set_image_loading(&mut self, loading: bool) {
        self.image_loading = loading;
    }
    fn set_image_url(&mut self, url: String) {
        self.image_url = Some(url);
    }
}

impl Portrayable for Scene {
    fn id(&self) -> &str {
        &self.id
    }
    fn image_loading(&self) -> bool {
        self.image_loading
    }
    fn set_image_loading(&mut self, loading: bool) {
        self.image_loading = loading;
    }
    fn set_image_url(&mut self, url: String) {
        self.image_url = Some(url);
    }
}

/// Result of trying to mark a portrait subject as loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortraitClaim {
    Claimed,
    AlreadyLoading,
    Unknown,
}

/// Present only while a batch run is active.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    pub current: usize,
    pub total: usize,
}

/// The whole script project. All mutation goes through the methods below.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default)]
    idea: String,
    #[serde(default = "default_genre")]
    genre: String,
    #[serde(default)]
    outline: String,
    #[serde(default)]
    characters: Vec<Character>,
    #[serde(default)]
    scenes: Vec<Scene>,
    #[serde(default)]
    episode_plan: EpisodePlan,
    #[serde(default)]
    episodes: BTreeMap<u32, String>,
    #[serde(default)]
    script_bible: String,
}

fn default_genre() -> String {
    DEFAULT_GENRE.to_string()
}

impl Default for Project {
    fn default() -> Self {
        Self {
            idea: String::new(),
            genre: default_genre(),
            outline: String::new(),
            characters: Vec::new(),
            scenes: Vec::new(),
            episode_plan: EpisodePlan::default(),
            episodes: BTreeMap::new(),
            script_bible: String::new(),
        }
    }
}

impl Project {
    pub fn idea(&self) -> &str {
        &self.idea
    }
    pub fn genre(&self) -> &str {
        &self.genre
    }
    pub fn outline(&self) -> &str {
        &self.outline
    }
    pub fn characters(&self) -> &[Character] {
        &self.characters
    }
    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }
    pub fn episode_plan(&self) -> &EpisodePlan {
        &self.episode_plan
    }
    pub fn episodes(&self) -> &BTreeMap<u32, String> {
        &self.episodes
    }
    pub fn episode(&self, number: u32) -> Option<&str> {
        self.episodes.get(&number).map(String::as_str)
    }
    pub fn script_bible(&self) -> &str {
        &self.script_bible
    }
    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == id)
    }
    pub fn scene(&self, id: &str) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }
    pub fn pending_numbers(&self) -> Vec<u32> {
        pending_numbers(&self.episode_plan, &self.episodes)
    }

    /// Text used as "previous episode" context for `number`.
    pub fn previous_content(&self, number: u32) -> &str {
        number
            .checked_sub(1)
            .and_then(|prev| self.episode(prev))
            .unwrap_or("")
    }

    pub fn set_idea(&mut self, idea: impl Into<String>) {
        self.idea = idea.into();
    }

    pub fn set_genre(&mut self, genre: impl Into<String>) {
        self.genre = genre.into();
    }

    pub fn set_outline(&mut self, outline: impl Into<String>) {
        self.outline = outline.into();
    }

    pub fn replace_characters(&mut self, characters: Vec<Character>) {
        self.characters = characters;
    }

    pub fn update_character(&mut self, id: &str, patch: CharacterPatch) -> bool {
        let Some(c) = self.characters.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        if let Some(v) = patch.name {
            c.name = v;
        }
        if let Some(v) = patch.age {
            c.age = v;
        }
        if let Some(v) = patch.role {
            c.role = v;
        }
        if let Some(v) = patch.personality {
            c.personality = v;
        }
        if let Some(v) = patch.appearance {
            c.appearance = v;
        }
        if let Some(v) = patch.visual_prompt {
            c.visual_prompt = Some(v);
        }
        true
    }

    pub fn replace_scenes(&mut self, scenes: Vec<Scene>) {
        self.scenes = scenes;
    }

    pub fn update_scene(&mut self, id: &str, patch: ScenePatch) -> bool {
        let Some(s) = self.scenes.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        if let Some(v) = patch.name {
            s.name = v;
        }
        if let Some(v) = patch.location {
            s.location = v;
        }
        if let Some(v) = patch.time_of_day {
            s.time_of_day = v;
        }
        if let Some(v) = patch.description {
            s.description = v;
        }
        if let Some(v) = patch.visual_prompt {
            s.visual_prompt = Some(v);
        }
        true
    }

    pub fn claim_character_portrait(&mut self, id: &str) -> PortraitClaim {
        claim(&mut self.characters, id)
    }

    pub fn finish_character_portrait(&mut self, id: &str, image_url: Option<String>) {
        finish(&mut self.characters, id, image_url)
    }

    pub fn claim_scene_portrait(&mut self, id: &str) -> PortraitClaim {
        claim(&mut self.scenes, id)
    }

    pub fn finish_scene_portrait(&mut self, id: &str, image_url: Option<String>) {
        finish(&mut self.scenes, id, image_url)
    }

    pub fn replace_plan(&mut self, entries: Vec<EpisodePlanEntry>) -> Result<(), PlanError> {
        self.episode_plan.replace(entries)
    }

    pub fn append_plan(&mut self, entries: Vec<EpisodePlanEntry>) -> Result<(), PlanError> {
        self.episode_plan.append(entries)
    }

    pub fn update_summary(&mut self, number: u32, summary: impl Into<String>) -> Result<(), PlanError> {
        self.episode_plan.update_summary(number, summary)
    }

    pub fn update_title(&mut self, number: u32, title: impl Into<String>) -> Result<(), PlanError> {
        self.episode_plan.update_title(number, title)
    }

    /// Removes a plan entry, renumbers the plan and moves generated text along with
    /// its entry. The removed entry's own text is dropped.
    pub fn remove_episode(&mut self, number: u32) -> Result<(), PlanError> {
        let mapping = self.episode_plan.remove_and_renumber(number)?;

        let mut old = std::mem::take(&mut self.episodes);
        old.remove(&number);

        let mut moved = BTreeMap::new();
        for (from, to) in &mapping {
            if let Some(text) = old.remove(from) {
                moved.insert(*to, text);
            }
        }
        // Whatever is left was never in the plan.
        for (n, text) in old {
            if moved.contains_key(&n) {
                warn!("Dropping orphaned episode {} text that collides with a renumbered entry", n);
                continue;
            }
            moved.insert(n, text);
        }
        self.episodes = moved;
        Ok(())
    }

    pub fn put_episode(&mut self, number: u32, text: impl Into<String>) {
        self.episodes.insert(number, text.into());
    }

    /// Drops the text of one episode so it is pending again.
    pub fn clear_episode(&mut self, number: u32) -> bool {
        self.episodes.remove(&number).is_some()
    }

    pub fn set_script_bible(&mut self, bible: impl Into<String>) {
        self.script_bible = bible.into();
    }

    /// Clears the plan and everything derived from it.
    pub fn reset_plan(&mut self) {
        self.episode_plan = EpisodePlan::default();
        self.episodes.clear();
        self.script_bible.clear();
    }
}

fn claim<T: Portrayable>(items: &mut [T], id: &str) -> PortraitClaim {
    match items.iter_mut().find(|i| i.id() == id) {
        None => PortraitClaim::Unknown,
        Some(item) if item.image_loading() => PortraitClaim::AlreadyLoading,
        Some(item) => {
            item.set_image_loading(true);
            PortraitClaim::Claimed
        }
    }
}

fn finish<T: Portrayable>(items: &mut [T], id: &str, image_url: Option<String>) {
    if let Some(item) = items.iter_mut().find(|i| i.id() == id) {
        item.set_image_loading(false);
        if let Some(url) = image_url {
            item.set_image_url(url);
        }
    }
}
