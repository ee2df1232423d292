use crate::core::config::{Config, GeminiConfig, OllamaConfig, API_KEY_ENV, DEFAULT_OLLAMA_URL};
use anyhow::Result;
use inquire::{Confirm, Password, PasswordDisplayMode, Select, Text};

const PROVIDERS: [&str; 2] = ["gemini", "ollama"];

/// Fills in whatever the selected backend still needs and offers to save it.
pub fn run_setup(config: &mut Config) -> Result<()> {
    let mut needs_save = false;
    let mut persist_key = true;

    if !PROVIDERS.contains(&config.llm.provider.as_str()) {
        let provider = Select::new("Select LLM provider:", PROVIDERS.to_vec()).prompt()?;
        config.llm.provider = provider.to_string();
        needs_save = true;
    }

    match config.llm.provider.as_str() {
        "ollama" => {
            if config.llm.ollama.is_none() {
                let base_url = Text::new("Ollama URL:")
                    .with_default(DEFAULT_OLLAMA_URL)
                    .prompt()?;
                let model = Text::new("Ollama model:").prompt()?;
                config.llm.ollama = Some(OllamaConfig { base_url, model });
                needs_save = true;
            }
        }
        _ => {
            if config.llm.gemini.is_none() {
                config.llm.gemini = Some(GeminiConfig::default());
                needs_save = true;
            }
            if config.resolve_api_key().is_none() {
                println!("No Gemini API key found in config.yml or {}.", API_KEY_ENV);
                let key = Password::new("Gemini API key:")
                    .with_display_mode(PasswordDisplayMode::Masked)
                    .without_confirmation()
                    .prompt()?;
                if let Some(gemini) = config.llm.gemini.as_mut() {
                    gemini.api_key = Some(key.trim().to_string());
                }
                persist_key = Confirm::new("Save the key to config.yml?")
                    .with_default(false)
                    .prompt()?;
                needs_save |= persist_key;
            }
        }
    }

    if needs_save {
        let mut on_disk = config.clone();
        if !persist_key {
            if let Some(gemini) = on_disk.llm.gemini.as_mut() {
                gemini.api_key = None;
            }
        }
        on_disk.save()?;
        println!("Configuration saved.");
    }
    Ok(())
}
