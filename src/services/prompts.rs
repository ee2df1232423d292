//! Instruction builders, one per generation purpose.
//!
//! Every builder is a pure function of its inputs: no clock, no randomness, no
//! map iteration, so a retried request is byte-for-byte the request that failed.

use crate::core::plan::EpisodePlanEntry;
use crate::core::state::{Character, Scene};
use crate::services::llm::GenerationRequest;
use crate::services::schema::Schema;
use crate::utils::text::{head_chars, is_truncated, tail_chars};

/// Leading part of the outline embedded in an episode prompt.
pub const OUTLINE_WINDOW: usize = 1000;
/// Trailing part of the previous episode embedded as recap context.
pub const PREVIOUS_WINDOW: usize = 800;
/// Leading part of pasted source material sent for analysis.
pub const SOURCE_WINDOW: usize = 5000;
/// Leading part of extra script material used for roster extraction.
pub const CORPUS_WINDOW: usize = 6000;
/// Outline window for bible synthesis.
pub const BIBLE_OUTLINE_WINDOW: usize = 4000;

pub const OUTLINE_VARIANTS: usize = 3;

pub fn outline_options_schema() -> Schema {
    Schema::array_of(Schema::String)
}

pub fn source_analysis_schema() -> Schema {
    Schema::object(&[
        ("idea", Schema::String),
        ("genre", Schema::String),
        ("outline", Schema::String),
    ])
}

pub fn character_schema() -> Schema {
    Schema::array_of(
        Schema::object(&[
            ("name", Schema::String),
            ("age", Schema::String),
            ("role", Schema::String),
            ("personality", Schema::String),
            ("appearance", Schema::String),
        ])
        .with_optional("visualPrompt", Schema::String),
    )
}

pub fn scene_schema() -> Schema {
    Schema::array_of(
        Schema::object(&[
            ("name", Schema::String),
            ("location", Schema::String),
            ("timeOfDay", Schema::String),
            ("description", Schema::String),
        ])
        .with_optional("visualPrompt", Schema::String),
    )
}

pub fn episode_plan_schema() -> Schema {
    Schema::array_of(Schema::object(&[
        ("number", Schema::Integer),
        ("title", Schema::String),
        ("summary", Schema::String),
    ]))
}

pub fn outline_options(idea: &str, genre: &str) -> GenerationRequest {
    let prompt = format!(
        "你是一位经验丰富的影视编剧。请根据下面的创意，构思 {count} 个差异明显的故事大纲方案。\
        \n\n类型：{genre}\
        \n创意：{idea}\
        \n\n要求：\
        \n- 每个方案的侧重点必须不同（例如：悬疑反转、情感纠葛、宏大世界观）。\
        \n- 每个方案都是一份完整的大纲，包含主要人物、核心冲突、起承转合与结局走向。\
        \n- 返回一个 JSON 数组，恰好包含 {count} 个字符串，每个字符串是一个方案。",
        count = OUTLINE_VARIANTS,
        genre = genre,
        idea = idea,
    );
    GenerationRequest::structured(prompt, outline_options_schema())
}

pub fn source_analysis(text: &str, genres: &[&str]) -> GenerationRequest {
    let prompt = format!(
        "请阅读以下文本（小说或剧本片段），提炼它的核心创意，判断最贴近的类型，并整理出一份标准的 Markdown 故事大纲。\
        \n\n可选类型：{genres}\
        \n\n文本：\n{text}\
        \n\n返回 JSON 对象：idea 为一句话创意，genre 为上面列表中的一个类型，outline 为整理后的大纲。",
        genres = genres.join("、"),
        text = head_chars(text, SOURCE_WINDOW),
    );
    GenerationRequest::structured(prompt, source_analysis_schema())
}

pub fn extract_characters(outline: &str, corpus: Option<&str>) -> GenerationRequest {
    let corpus_section = match corpus.filter(|c| !c.trim().is_empty()) {
        Some(c) => format!("\n\n已有剧本片段（供参考）：\n{}", head_chars(c, CORPUS_WINDOW)),
        None => String::new(),
    };
    let prompt = format!(
        "根据以下故事大纲提取主要角色（3-5 人）。\
        \n每个角色需要：name 姓名、age 年龄、role 角色定位（主角/反派/配角等）、personality 性格特征、\
        appearance 详细外貌（发型、五官、服装，用于 AI 绘画），以及可选的 visualPrompt（英文绘画提示词）。\
        \n\n大纲：\n{outline}{corpus}",
        outline = outline,
        corpus = corpus_section,
    );
    GenerationRequest::structured(prompt, character_schema())
}

pub fn extract_scenes(outline: &str, corpus: Option<&str>) -> GenerationRequest {
    let corpus_section = match corpus.filter(|c| !c.trim().is_empty()) {
        Some(c) => format!("\n\n已有剧本片段（供参考）：\n{}", head_chars(c, CORPUS_WINDOW)),
        None => String::new(),
    };
    let prompt = format!(
        "根据以下故事大纲提取反复出现的主要场景（3-6 个）。\
        \n每个场景需要：name 场景名、location 地点、timeOfDay 时间（日/夜等）、description 环境与氛围描写，\
        以及可选的 visualPrompt（英文绘画提示词）。\
        \n\n大纲：\n{outline}{corpus}",
        outline = outline,
        corpus = corpus_section,
    );
    GenerationRequest::structured(prompt, scene_schema())
}

pub fn plan_episodes(outline: &str, count: u32) -> GenerationRequest {
    let prompt = format!(
        "基于以下故事大纲，规划一部短剧的分集结构，必须恰好 {count} 集，编号从 1 到 {count}。\
        \n\n大纲：\n{outline}\
        \n\n返回 JSON 数组，每一项包含 number（集数）、title（标题）、summary（本集剧情摘要）。\
        \n剧情需要连贯，节奏有起承转合，每集结尾留有悬念。",
        count = count,
        outline = outline,
    );
    GenerationRequest::structured(prompt, episode_plan_schema())
}

pub fn extend_plan(outline: &str, last: &EpisodePlanEntry, count: u32) -> GenerationRequest {
    let first = last.number + 1;
    let end = last.number + count.max(1);
    let prompt = format!(
        "这部短剧需要续写后续剧情。请在已有分集之后继续规划，恰好 {count} 集，编号从 {first} 到 {end}。\
        \n\n故事大纲：\n{outline}\
        \n\n目前最后一集：第 {last_no} 集《{last_title}》\n{last_summary}\
        \n\n返回 JSON 数组，每一项包含 number、title、summary。新剧情要承接上一集，不要重复已有情节。",
        count = count.max(1),
        first = first,
        end = end,
        outline = head_chars(outline, OUTLINE_WINDOW),
        last_no = last.number,
        last_title = last.title,
        last_summary = last.summary,
    );
    GenerationRequest::structured(prompt, episode_plan_schema())
}

fn roster(characters: &[Character]) -> String {
    if characters.is_empty() {
        return "（暂无角色设定）".to_string();
    }
    characters
        .iter()
        .map(|c| format!("{} ({}): {}", c.name, c.role, c.personality))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn episode_script(
    outline: &str,
    characters: &[Character],
    entry: &EpisodePlanEntry,
    previous: &str,
) -> GenerationRequest {
    let outline_part = if is_truncated(outline, OUTLINE_WINDOW) {
        format!("{}...", head_chars(outline, OUTLINE_WINDOW))
    } else {
        outline.to_string()
    };
    let recap = if previous.trim().is_empty() {
        "（无前情，本集为开篇或上一集尚未生成。）".to_string()
    } else {
        tail_chars(previous, PREVIOUS_WINDOW).to_string()
    };

    let prompt = format!(
        "你是一位专业的影视编剧。请撰写第 {number} 集《{title}》的完整剧本。\
        \n\n【故事大纲】\n{outline}\
        \n\n【本集摘要】\n{summary}\
        \n\n【人物设定】\n{roster}\
        \n\n【前情提要】\n{recap}\
        \n\n【格式要求】\
        \n1. 场景标题加粗，格式为“场号、地点 时间 内/外”，例如 **1、客厅 日 内**。\
        \n2. 动作与画面描写顶格书写，不加前缀。\
        \n3. 对白写作 **角色名**：“台词”；情绪提示放在台词前的括号里。\
        \n4. 画外音写作 **角色名(OS)**：“内容”，旁白写作 **旁白**：“内容”。\
        \n\n请直接输出剧本正文。",
        number = entry.number,
        title = entry.title,
        outline = outline_part,
        summary = entry.summary,
        roster = roster(characters),
        recap = recap,
    );
    GenerationRequest::text(prompt)
}

pub fn script_bible(outline: &str, characters: &[Character], scenes: &[Scene]) -> GenerationRequest {
    let scene_list = if scenes.is_empty() {
        "（暂无场景设定）".to_string()
    } else {
        scenes
            .iter()
            .map(|s| format!("{}（{} {}）：{}", s.name, s.location, s.time_of_day, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let character_list = if characters.is_empty() {
        "（暂无角色设定）".to_string()
    } else {
        characters
            .iter()
            .map(|c| format!("{}，{}，{}。性格：{}。外貌：{}", c.name, c.age, c.role, c.personality, c.appearance))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let prompt = format!(
        "请为这部剧撰写一份剧本总纲（Series Bible），使用 Markdown 格式。\
        \n内容包括：一句话卖点、故事梗概、世界观与规则、人物小传与人物关系、主要场景、整体基调与风格。\
        \n\n【故事大纲】\n{outline}\
        \n\n【人物】\n{characters}\
        \n\n【场景】\n{scenes}",
        outline = head_chars(outline, BIBLE_OUTLINE_WINDOW),
        characters = character_list,
        scenes = scene_list,
    );
    GenerationRequest::text(prompt)
}

pub fn character_portrait(character: &Character, genre: &str) -> GenerationRequest {
    if let Some(visual) = character.visual_prompt.as_deref().filter(|v| !v.trim().is_empty()) {
        return GenerationRequest::image(visual);
    }
    let prompt = format!(
        "Character design sheet for {name}, a {age} year old {role} in a {genre} story.\
        \nCompose a 2x2 grid: close-up face portrait, full body front view, full body side view, back view or action pose.\
        \nAppearance: {appearance}.\
        \nPersonality: {personality}.\
        \nStyle: high quality concept art, cinematic lighting, detailed texture, clean background.",
        name = character.name,
        age = character.age,
        role = character.role,
        genre = genre,
        appearance = character.appearance,
        personality = character.personality,
    );
    GenerationRequest::image(prompt)
}

pub fn scene_portrait(scene: &Scene, genre: &str) -> GenerationRequest {
    if let Some(visual) = scene.visual_prompt.as_deref().filter(|v| !v.trim().is_empty()) {
        return GenerationRequest::image(visual);
    }
    let prompt = format!(
        "Establishing shot concept art for a {genre} drama.\
        \nLocation: {name}, {location}, {time}.\
        \nMood and details: {description}.\
        \nStyle: cinematic wide shot, film still, no characters in frame, no text.",
        genre = genre,
        name = scene.name,
        location = scene.location,
        time = scene.time_of_day,
        description = scene.description,
    );
    GenerationRequest::image(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::OutputMode;

    fn cast() -> Vec<Character> {
        vec![
            Character {
                id: "a".into(),
                name: "沈清".into(),
                age: "24".into(),
                role: "主角".into(),
                personality: "冷静".into(),
                appearance: "黑色长发".into(),
                ..Default::default()
            },
            Character {
                id: "b".into(),
                name: "陆川".into(),
                age: "30".into(),
                role: "反派".into(),
                personality: "多疑".into(),
                appearance: "西装".into(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_episode_script_is_deterministic() {
        let entry = EpisodePlanEntry::new(3, "对峙", "沈清发现真相");
        let outline = "大纲".repeat(800);
        let a = episode_script(&outline, &cast(), &entry, "上一集的结尾");
        let b = episode_script(&outline, &cast(), &entry, "上一集的结尾");
        assert_eq!(a, b);
        assert_eq!(a.mode, OutputMode::Text);
    }

    #[test]
    fn test_episode_script_windows_inputs() {
        let entry = EpisodePlanEntry::new(2, "t", "s");
        let outline = format!("{}TAIL_OF_OUTLINE", "甲".repeat(OUTLINE_WINDOW));
        let previous = format!("HEAD_OF_PREVIOUS{}", "乙".repeat(PREVIOUS_WINDOW));

        let req = episode_script(&outline, &cast(), &entry, &previous);
        assert!(!req.prompt.contains("TAIL_OF_OUTLINE"));
        assert!(!req.prompt.contains("HEAD_OF_PREVIOUS"));
        assert!(req.prompt.contains(&"乙".repeat(PREVIOUS_WINDOW)));
        assert!(req.prompt.contains("沈清 (主角): 冷静"));
    }

    #[test]
    fn test_episode_script_without_previous() {
        let entry = EpisodePlanEntry::new(1, "开端", "相遇");
        let req = episode_script("短大纲", &[], &entry, "");
        assert!(req.prompt.contains("无前情"));
        assert!(req.prompt.contains("短大纲"));
        assert!(!req.prompt.contains("短大纲..."));
    }

    #[test]
    fn test_plan_prompt_names_exact_count() {
        let req = plan_episodes("outline", 12);
        assert!(req.prompt.contains("恰好 12 集"));
        assert_eq!(req.mode, OutputMode::Structured(episode_plan_schema()));
    }

    #[test]
    fn test_extend_plan_continues_numbering() {
        let last = EpisodePlanEntry::new(8, "决裂", "两人分道扬镳");
        let req = extend_plan("outline", &last, 4);
        assert!(req.prompt.contains("编号从 9 到 12"));
        assert!(req.prompt.contains("决裂"));
    }

    #[test]
    fn test_portrait_prefers_visual_prompt() {
        let mut c = cast().remove(0);
        let req = character_portrait(&c, "悬疑");
        assert!(req.prompt.contains("黑色长发"));
        assert!(req.prompt.contains("悬疑"));

        c.visual_prompt = Some("portrait of a calm woman, rain".to_string());
        let req = character_portrait(&c, "悬疑");
        assert_eq!(req.prompt, "portrait of a calm woman, rain");
        assert_eq!(req.mode, OutputMode::Image);
    }

    #[test]
    fn test_scene_portrait_synthesizes_prompt() {
        let scene = Scene {
            id: "s".into(),
            name: "旧码头".into(),
            location: "海边".into(),
            time_of_day: "夜".into(),
            description: "雾气弥漫".into(),
            ..Default::default()
        };
        let req = scene_portrait(&scene, "悬疑");
        assert!(req.prompt.contains("旧码头"));
        assert!(req.prompt.contains("雾气弥漫"));
    }

    #[test]
    fn test_source_analysis_truncates_input() {
        let text = format!("{}MARKER", "字".repeat(SOURCE_WINDOW));
        let req = source_analysis(&text, &["科幻", "悬疑"]);
        assert!(!req.prompt.contains("MARKER"));
        assert!(req.prompt.contains("科幻、悬疑"));
    }

    #[test]
    fn test_extract_characters_includes_corpus_only_when_present() {
        assert!(!extract_characters("o", None).prompt.contains("已有剧本片段"));
        assert!(!extract_characters("o", Some("  ")).prompt.contains("已有剧本片段"));
        assert!(extract_characters("o", Some("第一集")).prompt.contains("已有剧本片段"));
    }

    #[test]
    fn test_bible_lists_scenes() {
        let scene = Scene {
            name: "天台".into(),
            ..Default::default()
        };
        let req = script_bible("outline", &cast(), &[scene]);
        assert!(req.prompt.contains("天台"));
        assert!(req.prompt.contains("陆川"));
        assert_eq!(req.mode, OutputMode::Text);
    }
}
