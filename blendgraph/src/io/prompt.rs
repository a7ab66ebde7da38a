//! Prompt builder for brain calls.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go first
//! and the last remaining section is truncated as a final resort.

use anyhow::{Context, Result};
use minijinja::{Environment, Value, context};
use tracing::debug;

use crate::core::state::CriticSolution;

const TEMPLATES: [(&str, &str); 8] = [
    ("planner", include_str!("prompts/planner.md")),
    ("retriever", include_str!("prompts/retriever.md")),
    ("coding_generate", include_str!("prompts/coding_generate.md")),
    ("coding_improve", include_str!("prompts/coding_improve.md")),
    ("coding_fix", include_str!("prompts/coding_fix.md")),
    ("critic", include_str!("prompts/critic.md")),
    ("verify_critic", include_str!("prompts/verify_critic.md")),
    ("verify_prompt", include_str!("prompts/verify_prompt.md")),
];

/// Least important first.
const DROP_ORDER: [&str; 4] = ["previous", "passages", "docs", "script"];

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render prompt template {name}"))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content, marker excluded.
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .unwrap_or_else(|err| panic!("section marker regex: {err}"))
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, body_start, key, required)) in markers.iter().enumerate() {
        let body_end = markers
            .get(i + 1)
            .map(|(start, ..)| *start)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..body_end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total - last.content.len());
    let before_len = last.content.len();
    const MARK: &str = "\n[truncated]";
    let keep = floor_char_boundary(&last.content, allowed.saturating_sub(MARK.len()));
    last.content.truncate(keep);
    if allowed > MARK.len() {
        last.content.push_str(MARK);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Inputs for a coding `generate` prompt.
#[derive(Debug, Clone)]
pub struct GenerateInputs<'a> {
    pub task: &'a str,
    pub subtask: &'a str,
    pub docs: Option<&'a str>,
    /// Scripts produced earlier in the batch, oldest first.
    pub previous_scripts: &'a [String],
}

/// Inputs for a coding `improve` prompt.
#[derive(Debug, Clone)]
pub struct ImproveInputs<'a> {
    pub task: &'a str,
    pub script: &'a str,
    pub solutions: &'a [CriticSolution],
    pub follow_up: Option<&'a str>,
    pub docs: Option<&'a str>,
}

/// Inputs for a coding `fix` prompt.
#[derive(Debug, Clone)]
pub struct FixInputs<'a> {
    pub script: &'a str,
    pub error: &'a str,
    pub docs: Option<&'a str>,
    /// Code that already ran before `script` (generate batches only).
    pub previous: Option<&'a str>,
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_planner(&self, task: &str, max_subtasks: usize) -> Result<PromptPack> {
        self.build(
            "planner",
            context! { task => task.trim(), max_subtasks => max_subtasks },
        )
    }

    pub fn build_retriever(&self, query: &str, passages: &[String]) -> Result<PromptPack> {
        self.build(
            "retriever",
            context! { query => query.trim(), passages => passages },
        )
    }

    pub fn build_generate(&self, input: &GenerateInputs<'_>) -> Result<PromptPack> {
        let previous = input.previous_scripts.join("\n\n");
        self.build(
            "coding_generate",
            context! {
                task => input.task.trim(),
                subtask => input.subtask.trim(),
                docs => non_blank(input.docs),
                previous => non_blank(Some(previous.as_str())),
            },
        )
    }

    pub fn build_improve(&self, input: &ImproveInputs<'_>) -> Result<PromptPack> {
        self.build(
            "coding_improve",
            context! {
                task => input.task.trim(),
                script => input.script,
                solutions => input.solutions,
                follow_up => non_blank(input.follow_up),
                docs => non_blank(input.docs),
            },
        )
    }

    pub fn build_fix(&self, input: &FixInputs<'_>) -> Result<PromptPack> {
        self.build(
            "coding_fix",
            context! {
                script => input.script,
                error => input.error.trim(),
                docs => non_blank(input.docs),
                previous => non_blank(input.previous),
            },
        )
    }

    pub fn build_critic(&self, validating_prompt: &str, script: &str) -> Result<PromptPack> {
        self.build(
            "critic",
            context! { validating_prompt => validating_prompt.trim(), script => script },
        )
    }

    pub fn build_verify_critic(&self, item: &CriticSolution) -> Result<PromptPack> {
        self.build(
            "verify_critic",
            context! { critic => item.critic.trim(), solution => item.solution.trim() },
        )
    }

    pub fn build_verify_prompt(&self, prompt: &str) -> Result<PromptPack> {
        self.build("verify_prompt", context! { prompt => prompt.trim() })
    }

    fn build(&self, name: &str, ctx: Value) -> Result<PromptPack> {
        let rendered = PromptEngine::new()?.render(name, ctx)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(PromptPack {
            content: render_sections(&sections),
        })
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

/// A rendered prompt ready to send to a brain.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solutions() -> Vec<CriticSolution> {
        vec![CriticSolution {
            critic: "legs float above the floor".to_string(),
            solution: "move legs down to z=0".to_string(),
        }]
    }

    /// Sections appear in template order with their XML tags.
    #[test]
    fn generate_prompt_sections_are_ordered() {
        let previous = vec!["import bpy\n# legs".to_string()];
        let pack = PromptBuilder::new(10_000)
            .build_generate(&GenerateInputs {
                task: "create a 3D chair",
                subtask: "seat",
                docs: Some("primitive_cube_add(size=2)"),
                previous_scripts: &previous,
            })
            .expect("build");
        let content = pack.render();

        let contract = content.find("<contract>").expect("contract");
        let subtask = content.find("<subtask>").expect("subtask");
        let docs = content.find("<docs>").expect("docs");
        let previous = content.find("<previous>").expect("previous");
        assert!(contract < subtask && subtask < docs && docs < previous);
        assert!(!content.contains("section:"), "markers are stripped");
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let pack = PromptBuilder::new(10_000)
            .build_generate(&GenerateInputs {
                task: "create a 3D chair",
                subtask: "legs",
                docs: None,
                previous_scripts: &[],
            })
            .expect("build");
        let content = pack.render();
        assert!(!content.contains("<docs>"));
        assert!(!content.contains("<previous>"));
    }

    /// With a tight budget the previous-script history goes before the docs,
    /// and required sections stay.
    #[test]
    fn budget_drops_history_first() {
        let previous = vec!["x = 1\n".repeat(200)];
        let pack = PromptBuilder::new(900)
            .build_generate(&GenerateInputs {
                task: "create a 3D chair",
                subtask: "seat",
                docs: Some("primitive_cube_add"),
                previous_scripts: &previous,
            })
            .expect("build");
        let content = pack.render();
        assert!(!content.contains("<previous>"));
        assert!(content.contains("<docs>"));
        assert!(content.contains("<subtask>"));
    }

    #[test]
    fn improve_prompt_lists_changes_and_follow_up() {
        let items = solutions();
        let pack = PromptBuilder::new(10_000)
            .build_improve(&ImproveInputs {
                task: "create a 3D chair",
                script: "import bpy",
                solutions: &items,
                follow_up: Some("make it red"),
                docs: None,
            })
            .expect("build");
        let content = pack.render();
        assert!(content.contains("Fix: move legs down to z=0"));
        assert!(content.contains("- make it red"));
        assert!(content.contains("<script>\nimport bpy\n</script>"));
    }

    #[test]
    fn fix_prompt_keeps_the_fragment_apart_from_earlier_code() {
        let pack = PromptBuilder::new(10_000)
            .build_fix(&FixInputs {
                script: "seat(radius)",
                error: "NameError: radius",
                docs: None,
                previous: Some("legs()"),
            })
            .expect("build");
        let content = pack.render();
        assert!(content.contains("return only the corrected failing part"));
        assert!(content.contains("<previous>\nlegs()\n</previous>"));
        assert!(content.contains("<script>\nseat(radius)\n</script>"));

        let whole = PromptBuilder::new(10_000)
            .build_fix(&FixInputs {
                script: "chair()",
                error: "RuntimeError",
                docs: None,
                previous: None,
            })
            .expect("build")
            .render();
        assert!(!whole.contains("<previous>"));
        assert!(!whole.contains("failing part"));
    }

    #[test]
    fn truncation_marks_last_section() {
        let mut sections = vec![
            ParsedSection {
                key: "contract".to_string(),
                required: true,
                content: "c".repeat(10),
            },
            ParsedSection {
                key: "script".to_string(),
                required: true,
                content: "s".repeat(100),
            },
        ];
        apply_budget_to_sections(&mut sections, 50);
        assert_eq!(sections.len(), 2);
        assert!(sections[1].content.ends_with("[truncated]"));
        assert!(sections.iter().map(|s| s.content.len()).sum::<usize>() <= 50);
    }
}
