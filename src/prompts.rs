//! Prompt templates for skill extraction.
//!
//! Providers take a single prompt string, so a template renders the
//! instructions and the sample into one text.

/// Rendered prompt ready to send.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub text: String,
}

/// Escape XML special characters so a sample cannot close its own tag.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub instructions: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, sample: &str) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug,
            text: format!(
                "{}\n\n<sample>\n{}\n</sample>",
                self.instructions.trim(),
                escape_xml_chars(sample.trim())
            ),
        }
    }
}

pub const SKILL_EXTRACTION_V1: PromptTemplate = PromptTemplate {
    slug: "skill_extraction_v1",
    instructions: r#"You are a helpful assistant that extracts programmatic and professional skills from a work sample. Return a JSON array where each item has:
- skill (string)
- level (number, 0-100)
- evidence (array of strings with snippets or reasons)
- confidence (number 0-1)
Return ONLY valid JSON. Example: [{"skill":"React","level":80,"evidence":["uses hooks","JSX components"],"confidence":0.92}]"#,
};

pub const DEFAULT_PROMPT: PromptTemplate = SKILL_EXTRACTION_V1;
