use crate::core::io::Storage;
use crate::core::state::Project;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use std::collections::HashSet;
use std::path::Path;

const NOT_GENERATED: &str = "(本集尚未生成)";

/// Plain text: bible first, then every planned episode under a banner.
pub fn export_text(project: &Project) -> String {
    let mut out = format!("【剧本总纲】\n\n{}\n\n", project.script_bible());
    for entry in project.episode_plan().entries() {
        out.push_str(&format!(
            "\n\n====================\n第 {} 集: {}\n====================\n\n",
            entry.number, entry.title
        ));
        out.push_str(project.episode(entry.number).unwrap_or(NOT_GENERATED));
    }
    out
}

/// HTML document that word processors open as `.doc`.
pub fn export_html(project: &Project) -> String {
    let mut out = String::from(
        "<html xmlns:o='urn:schemas-microsoft-com:office:office' xmlns:w='urn:schemas-microsoft-com:office:word' xmlns='http://www.w3.org/TR/REC-html40'>\n\
         <head><meta charset='utf-8'><title>剧本导出</title></head>\n<body>\n",
    );
    out.push_str("<h1>剧本总纲</h1>\n");
    out.push_str(&format!(
        "<div style=\"white-space: pre-wrap;\">{}</div>\n<hr/>\n",
        html_block(project.script_bible())
    ));
    for entry in project.episode_plan().entries() {
        out.push_str(&format!(
            "<h2 style=\"page-break-before: always;\">第 {} 集: {}</h2>\n",
            entry.number,
            escape_html(&entry.title)
        ));
        out.push_str(&format!(
            "<div style=\"white-space: pre-wrap;\">{}</div>\n",
            html_block(project.episode(entry.number).unwrap_or(NOT_GENERATED))
        ));
    }
    out.push_str("</body></html>\n");
    out
}

fn html_block(text: &str) -> String {
    escape_html(text).replace('\n', "<br/>")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Splits a `data:{mime};base64,{payload}` URL into its media type and bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>)> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URL"))?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| anyhow!("data URL is not base64 encoded"))?;
    Ok((mime.to_string(), BASE64.decode(payload)?))
}

/// Reduces a model-supplied name to a single path segment.
fn sanitize_filename_component(input: &str) -> String {
    let mut s: String = input
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '-' })
        .collect();
    while s.contains("--") {
        s = s.replace("--", "-");
    }
    s = s.trim_matches('-').to_string();
    if s.is_empty() {
        "unnamed".to_string()
    } else {
        s
    }
}

fn image_extension(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Writes the script as `.txt` and `.doc`, plus every generated portrait, into
/// `folder`. Returns the written paths.
pub async fn write_exports(storage: &dyn Storage, folder: &str, project: &Project) -> Result<Vec<String>> {
    let dir = Path::new(folder);
    let mut written = Vec::new();

    let txt = dir.join("剧本合集.txt").to_string_lossy().to_string();
    storage.write(&txt, export_text(project).as_bytes()).await?;
    written.push(txt);

    let doc = dir.join("剧本全集.doc").to_string_lossy().to_string();
    storage.write(&doc, export_html(project).as_bytes()).await?;
    written.push(doc);

    let portraits = project
        .characters()
        .iter()
        .map(|c| (&c.name, c.image_url.as_deref(), "character_design"))
        .chain(
            project
                .scenes()
                .iter()
                .map(|s| (&s.name, s.image_url.as_deref(), "scene")),
        );
    let mut used = HashSet::new();
    for (name, url, suffix) in portraits {
        let Some(url) = url else { continue };
        match decode_data_url(url) {
            Ok((mime, bytes)) => {
                let stem = sanitize_filename_component(name);
                let ext = image_extension(&mime);
                let mut file = format!("{}_{}.{}", stem, suffix, ext);
                let mut n = 2;
                while !used.insert(file.clone()) {
                    file = format!("{}_{}_{}.{}", stem, suffix, n, ext);
                    n += 1;
                }
                let path = dir.join(file).to_string_lossy().to_string();
                storage.write(&path, &bytes).await?;
                written.push(path);
            }
            Err(e) => warn!("Skipping image for {}: {}", name, e),
        }
    }

    info!("Exported {} files to {}", written.len(), folder);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::InMemoryStorage;
    use crate::core::plan::EpisodePlanEntry;
    use crate::core::state::Character;
    use crate::services::llm::ImageData;

    fn project() -> Project {
        let mut p = Project::default();
        p.replace_plan(vec![
            EpisodePlanEntry::new(1, "雨夜", "s1"),
            EpisodePlanEntry::new(2, "<对峙>", "s2"),
        ])
        .unwrap();
        p.put_episode(1, "**1、客厅 日 内**\n沈清：“你来了。”");
        p.set_script_bible("# 总纲");
        p
    }

    #[test]
    fn test_text_export_marks_missing_episodes() {
        let text = export_text(&project());
        assert!(text.starts_with("【剧本总纲】\n\n# 总纲"));
        assert!(text.contains("第 1 集: 雨夜"));
        assert!(text.contains("沈清：“你来了。”"));
        assert!(text.ends_with(NOT_GENERATED));
    }

    #[test]
    fn test_html_export_escapes_content() {
        let html = export_html(&project());
        assert!(html.contains("第 2 集: &lt;对峙&gt;"));
        assert!(html.contains("**1、客厅 日 内**<br/>"));
        assert!(!html.contains("<对峙>"));
        assert!(html.trim_end().ends_with("</body></html>"));
    }

    #[test]
    fn test_decode_data_url() {
        let image = ImageData {
            mime_type: "image/png".to_string(),
            bytes: vec![137, 80, 78, 71],
        };
        let (mime, bytes) = decode_data_url(&image.to_data_url()).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![137, 80, 78, 71]);
        assert!(decode_data_url("https://example.com/a.png").is_err());
    }

    #[test]
    fn test_sanitize_filename_component() {
        assert_eq!(sanitize_filename_component("沈清"), "沈清");
        assert_eq!(sanitize_filename_component("../../evil"), "evil");
        assert_eq!(sanitize_filename_component("a/b\\c d"), "a-b-c-d");
        assert_eq!(sanitize_filename_component("/"), "unnamed");
    }

    #[tokio::test]
    async fn test_portrait_files_stay_in_folder_and_do_not_collide() {
        let storage = InMemoryStorage::new();
        let mut p = project();
        let url = ImageData {
            mime_type: "image/png".to_string(),
            bytes: vec![9],
        }
        .to_data_url();
        let named = |id: &str, name: &str| Character {
            id: id.into(),
            name: name.into(),
            image_url: Some(url.clone()),
            ..Default::default()
        };
        p.replace_characters(vec![named("a", "../../evil"), named("b", "沈清"), named("c", "沈清")]);

        let written = write_exports(&storage, "output", &p).await.unwrap();

        assert_eq!(
            written[2..].to_vec(),
            vec![
                "output/evil_character_design.png",
                "output/沈清_character_design.png",
                "output/沈清_character_design_2.png",
            ]
        );
        assert!(written.iter().all(|w| w.starts_with("output/") && !w.contains("..")));
    }

    #[tokio::test]
    async fn test_write_exports() {
        let storage = InMemoryStorage::new();
        let mut p = project();
        let url = ImageData {
            mime_type: "image/jpeg".to_string(),
            bytes: vec![1, 2, 3],
        }
        .to_data_url();
        p.replace_characters(vec![
            Character {
                id: "a".into(),
                name: "沈清".into(),
                image_url: Some(url),
                ..Default::default()
            },
            Character {
                id: "b".into(),
                name: "陆川".into(),
                ..Default::default()
            },
        ]);

        let written = write_exports(&storage, "output", &p).await.unwrap();

        assert_eq!(written.len(), 3);
        assert!(storage.exists("output/剧本合集.txt").await.unwrap());
        assert!(storage.exists("output/剧本全集.doc").await.unwrap());
        assert_eq!(storage.read("output/沈清_character_design.jpg").await.unwrap(), vec![1, 2, 3]);
    }
}
