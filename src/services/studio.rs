use crate::core::config::Config;
use crate::core::error::{PlanError, StudioError, StudioResult};
use crate::core::io::Storage;
use crate::core::plan::EpisodePlanEntry;
use crate::core::state::{
    new_id, Character, CharacterPatch, PortraitClaim, Project, Scene, ScenePatch, PRESET_GENRES,
};
use crate::core::store::ProjectStore;
use crate::services::batch::{BatchEvent, BatchOutcome, BatchPolicy, BatchRunner};
use crate::services::export;
use crate::services::generation::GenerationClient;
use crate::services::prompts;
use futures_util::StreamExt;
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of analyzing pasted source material.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceAnalysis {
    pub idea: String,
    pub genre: String,
    pub outline: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CharacterDraft {
    name: String,
    age: String,
    role: String,
    personality: String,
    appearance: String,
    #[serde(default)]
    visual_prompt: Option<String>,
}

impl From<CharacterDraft> for Character {
    fn from(d: CharacterDraft) -> Self {
        Character {
            id: new_id(),
            name: d.name,
            age: d.age,
            role: d.role,
            personality: d.personality,
            appearance: d.appearance,
            visual_prompt: d.visual_prompt,
            image_url: None,
            image_loading: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneDraft {
    name: String,
    location: String,
    time_of_day: String,
    description: String,
    #[serde(default)]
    visual_prompt: Option<String>,
}

impl From<SceneDraft> for Scene {
    fn from(d: SceneDraft) -> Self {
        Scene {
            id: new_id(),
            name: d.name,
            location: d.location,
            time_of_day: d.time_of_day,
            description: d.description,
            visual_prompt: d.visual_prompt,
            image_url: None,
            image_loading: false,
        }
    }
}

#[derive(Clone, Copy)]
enum Subject {
    Character,
    Scene,
}

fn unknown(subject: Subject, id: &str) -> StudioError {
    match subject {
        Subject::Character => StudioError::UnknownCharacter(id.to_string()),
        Subject::Scene => StudioError::UnknownScene(id.to_string()),
    }
}

/// Every caller-facing operation over one project.
///
/// Single-shot operations make exactly one generation attempt and report failure
/// to the caller; only [`Studio::run_batch`] retries.
pub struct Studio {
    config: Config,
    client: GenerationClient,
    store: ProjectStore,
    storage: Arc<dyn Storage>,
}

impl Studio {
    pub fn new(config: Config, client: GenerationClient, store: ProjectStore, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            client,
            store,
            storage,
        }
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn commit<R>(&self, f: impl FnOnce(&mut Project) -> R) -> StudioResult<R> {
        self.store.update(f).await.map_err(StudioError::Storage)
    }

    async fn try_commit<T>(
        &self,
        f: impl FnOnce(&mut Project) -> Result<T, PlanError>,
    ) -> StudioResult<T> {
        Ok(self.store.try_update(f).await.map_err(StudioError::Storage)??)
    }

    // --- Idea & outline ---

    pub async fn set_idea(&self, idea: &str, genre: &str) -> StudioResult<()> {
        self.commit(|p| {
            p.set_idea(idea);
            p.set_genre(genre);
        })
        .await
    }

    /// Asks for three outline variants. Nothing is stored until one is selected.
    pub async fn generate_outline_options(&self) -> StudioResult<Vec<String>> {
        let request = self.store.read(|p| prompts::outline_options(p.idea(), p.genre()));
        let options: Vec<String> = self.client.structured(&request).await?;
        if options.len() != prompts::OUTLINE_VARIANTS {
            warn!("Asked for {} outline options, got {}", prompts::OUTLINE_VARIANTS, options.len());
        }
        Ok(options)
    }

    pub async fn select_outline(&self, outline: &str) -> StudioResult<()> {
        self.commit(|p| p.set_outline(outline)).await
    }

    /// Derives idea, genre and outline from pasted prose or script and stores all three.
    pub async fn analyze_source(&self, text: &str) -> StudioResult<SourceAnalysis> {
        let request = prompts::source_analysis(text, &PRESET_GENRES);
        let analysis: SourceAnalysis = self.client.structured(&request).await?;
        let applied = analysis.clone();
        self.commit(move |p| {
            p.set_idea(applied.idea);
            p.set_genre(applied.genre);
            p.set_outline(applied.outline);
        })
        .await?;
        info!("Source analyzed as {}", analysis.genre);
        Ok(analysis)
    }

    // --- Characters & scenes ---

    pub async fn extract_characters(&self, corpus: Option<&str>) -> StudioResult<Vec<Character>> {
        let request = self.store.read(|p| prompts::extract_characters(p.outline(), corpus));
        let drafts: Vec<CharacterDraft> = self.client.structured(&request).await?;
        let characters: Vec<Character> = drafts.into_iter().map(Character::from).collect();
        info!("Extracted {} characters", characters.len());
        let roster = characters.clone();
        self.commit(move |p| p.replace_characters(roster)).await?;
        Ok(characters)
    }

    pub async fn extract_scenes(&self, corpus: Option<&str>) -> StudioResult<Vec<Scene>> {
        let request = self.store.read(|p| prompts::extract_scenes(p.outline(), corpus));
        let drafts: Vec<SceneDraft> = self.client.structured(&request).await?;
        let scenes: Vec<Scene> = drafts.into_iter().map(Scene::from).collect();
        info!("Extracted {} scenes", scenes.len());
        let list = scenes.clone();
        self.commit(move |p| p.replace_scenes(list)).await?;
        Ok(scenes)
    }

    pub async fn update_character(&self, id: &str, patch: CharacterPatch) -> StudioResult<()> {
        if self.commit(|p| p.update_character(id, patch)).await? {
            Ok(())
        } else {
            Err(StudioError::UnknownCharacter(id.to_string()))
        }
    }

    pub async fn update_scene(&self, id: &str, patch: ScenePatch) -> StudioResult<()> {
        if self.commit(|p| p.update_scene(id, patch)).await? {
            Ok(())
        } else {
            Err(StudioError::UnknownScene(id.to_string()))
        }
    }

    /// Generates a portrait and stores it as a data URL. On failure the previous
    /// image, if any, is kept.
    pub async fn generate_character_portrait(&self, id: &str) -> StudioResult<String> {
        self.generate_portrait(Subject::Character, id).await
    }

    pub async fn generate_scene_portrait(&self, id: &str) -> StudioResult<String> {
        self.generate_portrait(Subject::Scene, id).await
    }

    async fn generate_portrait(&self, subject: Subject, id: &str) -> StudioResult<String> {
        // The loading flag is never persisted, so claiming does not save.
        let claim = self.store.mutate(|p| match subject {
            Subject::Character => p.claim_character_portrait(id),
            Subject::Scene => p.claim_scene_portrait(id),
        });
        match claim {
            PortraitClaim::Claimed => {}
            PortraitClaim::AlreadyLoading => return Err(StudioError::PortraitInFlight(id.to_string())),
            PortraitClaim::Unknown => return Err(unknown(subject, id)),
        }

        let request = self.store.read(|p| match subject {
            Subject::Character => p.character(id).map(|c| prompts::character_portrait(c, p.genre())),
            Subject::Scene => p.scene(id).map(|s| prompts::scene_portrait(s, p.genre())),
        });
        let result = match request {
            Some(request) => self
                .client
                .image(&request)
                .await
                .map(|image| image.to_data_url())
                .map_err(StudioError::from),
            None => Err(unknown(subject, id)),
        };

        let url = result.as_ref().ok().cloned();
        if let Err(e) = &result {
            warn!("Portrait for {} failed: {}", id, e);
        }
        self.commit(|p| match subject {
            Subject::Character => p.finish_character_portrait(id, url),
            Subject::Scene => p.finish_scene_portrait(id, url),
        })
        .await?;
        result
    }

    /// Portraits for every character, a few at a time. Each id succeeds or fails on its own.
    pub async fn generate_all_portraits(&self) -> Vec<(String, StudioResult<String>)> {
        let ids: Vec<String> = self.store.read(|p| p.characters().iter().map(|c| c.id.clone()).collect());
        let concurrency = self.config.llm.portrait_concurrency.max(1);
        info!("Generating {} portraits ({} at a time)", ids.len(), concurrency);

        futures_util::stream::iter(ids)
            .map(|id| async move {
                let result = self.generate_character_portrait(&id).await;
                (id, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    // --- Episode plan ---

    /// Replaces the plan. Existing episode text is kept; a short answer is accepted as is.
    pub async fn plan_episodes(&self, count: u32) -> StudioResult<Vec<EpisodePlanEntry>> {
        let request = self.store.read(|p| prompts::plan_episodes(p.outline(), count));
        let entries: Vec<EpisodePlanEntry> = self.client.structured(&request).await?;
        if entries.len() != count as usize {
            warn!("Asked for {} episodes, the plan has {}", count, entries.len());
        }
        let plan = entries.clone();
        self.try_commit(move |p| p.replace_plan(plan)).await?;
        info!("Planned {} episodes", entries.len());
        Ok(entries)
    }

    /// Appends `count` entries continuing after the last planned episode.
    pub async fn extend_plan(&self, count: u32) -> StudioResult<Vec<EpisodePlanEntry>> {
        let request = self
            .store
            .read(|p| {
                p.episode_plan()
                    .last()
                    .map(|last| prompts::extend_plan(p.outline(), last, count))
            })
            .ok_or(StudioError::EmptyPlan)?;
        let entries: Vec<EpisodePlanEntry> = self.client.structured(&request).await?;
        let added = entries.clone();
        self.try_commit(move |p| p.append_plan(added)).await?;
        info!("Extended plan by {} episodes", entries.len());
        Ok(entries)
    }

    pub async fn update_summary(&self, number: u32, summary: &str) -> StudioResult<()> {
        self.try_commit(|p| p.update_summary(number, summary)).await
    }

    pub async fn update_title(&self, number: u32, title: &str) -> StudioResult<()> {
        self.try_commit(|p| p.update_title(number, title)).await
    }

    /// Removes an entry and closes the gap. Later episodes keep their text under their new numbers.
    pub async fn remove_episode(&self, number: u32) -> StudioResult<()> {
        self.try_commit(|p| p.remove_episode(number)).await
    }

    /// Clears the plan, every episode and the bible.
    pub async fn reset_plan(&self) -> StudioResult<()> {
        self.commit(|p| p.reset_plan()).await?;
        info!("Episode plan reset");
        Ok(())
    }

    // --- Episodes & bible ---

    /// Writes (or rewrites) one episode with a single attempt.
    pub async fn generate_episode(&self, number: u32) -> StudioResult<String> {
        let request = self
            .store
            .read(|p| {
                p.episode_plan()
                    .get(number)
                    .map(|entry| prompts::episode_script(p.outline(), p.characters(), entry, p.previous_content(number)))
            })
            .ok_or(PlanError::UnknownEpisode(number))?;
        let text = self.client.text(&request).await?;
        let stored = text.clone();
        self.commit(move |p| p.put_episode(number, stored)).await?;
        info!("Episode {} written", number);
        Ok(text)
    }

    /// Manual edit. Blank text clears the episode so the next batch writes it again.
    pub async fn set_episode_text(&self, number: u32, text: &str) -> StudioResult<()> {
        self.try_commit(|p| {
            if p.episode_plan().get(number).is_none() {
                return Err(PlanError::UnknownEpisode(number));
            }
            if text.trim().is_empty() {
                p.clear_episode(number);
            } else {
                p.put_episode(number, text);
            }
            Ok(())
        })
        .await
    }

    pub async fn generate_bible(&self) -> StudioResult<String> {
        let request = self
            .store
            .read(|p| prompts::script_bible(p.outline(), p.characters(), p.scenes()));
        let bible = self.client.text(&request).await?;
        let stored = bible.clone();
        self.commit(move |p| p.set_script_bible(stored)).await?;
        Ok(bible)
    }

    /// Runs the sequential batch over every pending episode.
    pub async fn run_batch(&self, events: mpsc::UnboundedSender<BatchEvent>) -> StudioResult<BatchOutcome> {
        let runner = BatchRunner::new(
            self.client.clone(),
            self.store.clone(),
            BatchPolicy::from(&self.config.batch),
        );
        Ok(runner.run(events).await?)
    }

    // --- Export ---

    pub async fn export(&self) -> StudioResult<Vec<String>> {
        let project = self.store.snapshot();
        export::write_exports(self.storage.as_ref(), &self.config.output_folder, &project)
            .await
            .map_err(StudioError::Storage)
    }
}
