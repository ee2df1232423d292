use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, CustomType, Select, Text};
use script_studio::core::config::Config;
use script_studio::core::io::{NativeStorage, Storage};
use script_studio::core::plan::EpisodePlanEntry;
use script_studio::core::state::{CharacterPatch, PRESET_GENRES};
use script_studio::core::store::ProjectStore;
use script_studio::services::batch::{BatchEvent, BatchOutcome, Decision};
use script_studio::services::generation::GenerationClient;
use script_studio::services::llm::create_llm;
use script_studio::services::setup;
use script_studio::services::studio::Studio;
use script_studio::utils::text::head_chars;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
enum Action {
    SetIdea,
    AnalyzeSource,
    OutlineOptions,
    ExtractCharacters,
    EditCharacter,
    ExtractScenes,
    Portraits,
    PlanEpisodes,
    ExtendPlan,
    EditPlan,
    GenerateEpisode,
    ImportEpisode,
    RunBatch,
    GenerateBible,
    Export,
    ResetPlan,
    Quit,
}

impl Action {
    const ALL: [Action; 17] = [
        Action::SetIdea,
        Action::AnalyzeSource,
        Action::OutlineOptions,
        Action::ExtractCharacters,
        Action::EditCharacter,
        Action::ExtractScenes,
        Action::Portraits,
        Action::PlanEpisodes,
        Action::ExtendPlan,
        Action::EditPlan,
        Action::GenerateEpisode,
        Action::ImportEpisode,
        Action::RunBatch,
        Action::GenerateBible,
        Action::Export,
        Action::ResetPlan,
        Action::Quit,
    ];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Action::SetIdea => "Set idea and genre",
            Action::AnalyzeSource => "Analyze a novel or script file",
            Action::OutlineOptions => "Generate outline options",
            Action::ExtractCharacters => "Extract characters",
            Action::EditCharacter => "Edit a character",
            Action::ExtractScenes => "Extract scenes",
            Action::Portraits => "Generate character portraits",
            Action::PlanEpisodes => "Plan episodes",
            Action::ExtendPlan => "Extend the plan",
            Action::EditPlan => "Edit the plan",
            Action::GenerateEpisode => "Write one episode",
            Action::ImportEpisode => "Replace an episode's text from a file",
            Action::RunBatch => "Write all pending episodes",
            Action::GenerateBible => "Write the series bible",
            Action::Export => "Export",
            Action::ResetPlan => "Reset plan and episodes",
            Action::Quit => "Quit",
        };
        f.write_str(label)
    }
}

struct EntryChoice(EpisodePlanEntry, bool);

impl fmt::Display for EntryChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.1 { "✓" } else { " " };
        write!(f, "[{}] 第 {} 集: {}", mark, self.0.number, self.0.title)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please fix 'config.yml' or remove it to use the defaults.");
            return Err(e);
        }
    };
    config.ensure_directories()?;
    setup::run_setup(&mut config)?;

    let llm = create_llm(&config)?;
    let client = GenerationClient::new(llm, config.resolve_api_key());
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let store = ProjectStore::open(storage.clone(), &config.project_file).await?;
    let studio = Studio::new(config, client, store, storage);

    loop {
        print_status(&studio);
        let action = Select::new("What next?", Action::ALL.to_vec())
            .with_page_size(Action::ALL.len())
            .prompt()?;
        if let Action::Quit = action {
            break;
        }
        if let Err(e) = handle(&studio, action).await {
            eprintln!("✗ {:#}", e);
        }
    }

    Ok(())
}

fn print_status(studio: &Studio) {
    let project = studio.store().snapshot();
    println!();
    println!(
        "Genre: {} | Idea: {}",
        project.genre(),
        if project.idea().is_empty() { "(none)" } else { head_chars(project.idea(), 40) }
    );
    println!(
        "Outline: {} chars | Characters: {} | Scenes: {} | Episodes: {}/{} | Bible: {}",
        project.outline().chars().count(),
        project.characters().len(),
        project.scenes().len(),
        project.episodes().len(),
        project.episode_plan().len(),
        if project.script_bible().is_empty() { "no" } else { "yes" }
    );
}

async fn handle(studio: &Studio, action: Action) -> Result<()> {
    match action {
        Action::SetIdea => {
            let current = studio.store().snapshot();
            let idea = Text::new("Idea:").with_initial_value(current.idea()).prompt()?;
            let genre = Select::new("Genre:", PRESET_GENRES.to_vec()).prompt()?;
            studio.set_idea(&idea, genre).await?;
        }
        Action::AnalyzeSource => {
            let path = Text::new("Path to a .txt file:").prompt()?;
            let text = std::fs::read_to_string(path.trim()).with_context(|| format!("Failed to read {}", path))?;
            println!("Analyzing...");
            let analysis = studio.analyze_source(&text).await?;
            println!("Idea: {}\nGenre: {}\n\n{}", analysis.idea, analysis.genre, analysis.outline);
        }
        Action::OutlineOptions => {
            println!("Generating outline options...");
            let options = studio.generate_outline_options().await?;
            let labels: Vec<String> = options
                .iter()
                .enumerate()
                .map(|(i, o)| format!("{}. {}", i + 1, head_chars(o, 60).replace('\n', " ")))
                .collect();
            for (i, option) in options.iter().enumerate() {
                println!("\n===== Option {} =====\n{}", i + 1, option);
            }
            let picked = Select::new("Use which outline?", labels.clone()).prompt()?;
            if let Some(idx) = labels.iter().position(|l| *l == picked) {
                studio.select_outline(&options[idx]).await?;
                println!("Outline saved.");
            }
        }
        Action::ExtractCharacters | Action::ExtractScenes => {
            let project = studio.store().snapshot();
            let corpus: String = project.episodes().values().cloned().collect::<Vec<_>>().join("\n\n");
            let use_corpus = !corpus.is_empty()
                && Confirm::new("Use the written episodes as reference?")
                    .with_default(true)
                    .prompt()?;
            let corpus = use_corpus.then_some(corpus.as_str());
            if let Action::ExtractCharacters = action {
                for c in studio.extract_characters(corpus).await? {
                    println!("- {} ({}, {}): {}", c.name, c.age, c.role, c.personality);
                }
            } else {
                for s in studio.extract_scenes(corpus).await? {
                    println!("- {} [{} {}]: {}", s.name, s.location, s.time_of_day, s.description);
                }
            }
        }
        Action::EditCharacter => {
            let characters = studio.store().read(|p| p.characters().to_vec());
            if characters.is_empty() {
                println!("No characters yet.");
                return Ok(());
            }
            let names: Vec<String> = characters.iter().map(|c| format!("{} ({})", c.name, c.role)).collect();
            let picked = Select::new("Character:", names.clone()).prompt()?;
            let Some(character) = names.iter().position(|n| *n == picked).map(|i| &characters[i]) else {
                return Ok(());
            };
            let appearance = Text::new("Appearance:")
                .with_initial_value(&character.appearance)
                .prompt()?;
            let visual = Text::new("Visual prompt (empty to keep):").prompt()?;
            let patch = CharacterPatch {
                appearance: Some(appearance),
                visual_prompt: Some(visual).filter(|v| !v.trim().is_empty()),
                ..Default::default()
            };
            studio.update_character(&character.id, patch).await?;
        }
        Action::Portraits => {
            println!("Generating portraits...");
            for (id, result) in studio.generate_all_portraits().await {
                let name = studio
                    .store()
                    .read(|p| p.character(&id).map(|c| c.name.clone()))
                    .unwrap_or(id);
                match result {
                    Ok(_) => println!("✓ {}", name),
                    Err(e) => println!("✗ {}: {}", name, e),
                }
            }
        }
        Action::PlanEpisodes => {
            let count = CustomType::<u32>::new("How many episodes?").with_default(20).prompt()?;
            println!("Planning...");
            let entries = studio.plan_episodes(count).await?;
            println!("Planned {} episodes.", entries.len());
        }
        Action::ExtendPlan => {
            let count = CustomType::<u32>::new("How many more episodes?").with_default(10).prompt()?;
            println!("Extending...");
            let entries = studio.extend_plan(count).await?;
            println!("Added {} episodes.", entries.len());
        }
        Action::EditPlan => {
            let Some(entry) = pick_entry(studio, "Edit which episode?")? else {
                return Ok(());
            };
            let what = Select::new("Change:", vec!["Title", "Summary", "Remove"]).prompt()?;
            match what {
                "Title" => {
                    let title = Text::new("Title:").with_initial_value(&entry.title).prompt()?;
                    studio.update_title(entry.number, &title).await?;
                }
                "Summary" => {
                    let summary = Text::new("Summary:").with_initial_value(&entry.summary).prompt()?;
                    studio.update_summary(entry.number, &summary).await?;
                }
                _ => {
                    if Confirm::new(&format!("Remove episode {} and renumber the rest?", entry.number))
                        .with_default(false)
                        .prompt()?
                    {
                        studio.remove_episode(entry.number).await?;
                    }
                }
            }
        }
        Action::GenerateEpisode => {
            let Some(entry) = pick_entry(studio, "Write which episode?")? else {
                return Ok(());
            };
            println!("Writing episode {}...", entry.number);
            let text = studio.generate_episode(entry.number).await?;
            println!("{}", text);
        }
        Action::ImportEpisode => {
            let Some(entry) = pick_entry(studio, "Replace which episode?")? else {
                return Ok(());
            };
            let path = Text::new("Path to the text (an empty file clears the episode):").prompt()?;
            let text = std::fs::read_to_string(path.trim()).with_context(|| format!("Failed to read {}", path))?;
            studio.set_episode_text(entry.number, &text).await?;
        }
        Action::RunBatch => run_batch(studio).await?,
        Action::GenerateBible => {
            println!("Writing the bible...");
            let bible = studio.generate_bible().await?;
            println!("{}", bible);
        }
        Action::Export => {
            for path in studio.export().await? {
                println!("Wrote {}", path);
            }
        }
        Action::ResetPlan => {
            if Confirm::new("Delete the plan, every episode and the bible?")
                .with_default(false)
                .prompt()?
            {
                studio.reset_plan().await?;
            }
        }
        Action::Quit => {}
    }
    Ok(())
}

fn pick_entry(studio: &Studio, prompt: &str) -> Result<Option<EpisodePlanEntry>> {
    let choices: Vec<EntryChoice> = studio.store().read(|p| {
        p.episode_plan()
            .entries()
            .iter()
            .map(|e| EntryChoice(e.clone(), p.episode(e.number).is_some()))
            .collect()
    });
    if choices.is_empty() {
        println!("The plan is empty.");
        return Ok(None);
    }
    let picked = Select::new(prompt, choices).prompt()?;
    Ok(Some(picked.0))
}

async fn run_batch(studio: &Studio) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumer = async {
        let pb = ProgressBar::hidden();
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::Started { total } => {
                    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    pb.set_length(total as u64);
                    if let Ok(style) = ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    {
                        pb.set_style(style.progress_chars("#>-"));
                    }
                }
                BatchEvent::Progress(progress) => pb.set_position(progress.current as u64),
                BatchEvent::EpisodeWritten { number } => pb.set_message(format!("episode {} done", number)),
                BatchEvent::AttemptFailed { number, attempt, kind } => {
                    pb.println(format!("Episode {} attempt {} failed ({})", number, attempt, kind));
                }
                BatchEvent::DecisionRequired(request) => {
                    let question = format!(
                        "Episode {} failed after several attempts. Skip it and continue with the remaining {}?",
                        request.number, request.remaining
                    );
                    let skip = pb.suspend(|| Confirm::new(&question).with_default(true).prompt());
                    let decision = match skip {
                        Ok(true) => Decision::Continue,
                        _ => Decision::Abort,
                    };
                    request.respond(decision);
                }
                BatchEvent::Finished(_) => pb.finish_and_clear(),
            }
        }
    };

    let (outcome, ()) = tokio::join!(studio.run_batch(tx), consumer);
    match outcome? {
        BatchOutcome::AllComplete => println!("Every planned episode is already written."),
        BatchOutcome::Ran(report) => {
            println!(
                "Wrote {} episodes, skipped {}{}.",
                report.written.len(),
                report.skipped.len(),
                if report.aborted { ", stopped early" } else { "" }
            );
            if !report.skipped.is_empty() || report.aborted {
                println!("Run the batch again to retry what is still missing.");
            }
        }
    }
    Ok(())
}
