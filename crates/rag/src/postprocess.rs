//! Safety pass applied to every answer before it is returned or cached.

use nestling_config::SafetyConfig;
use nestling_core::error::Error;
use regex_lite::Regex;

const REDACTION: &str = "[redacted]";

/// A finalized answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub text: String,
    /// Clinical terminology was found and the disclaimer appended.
    pub clinical: bool,
    pub redactions: usize,
}

/// Redacts configured terms, appends the medical disclaimer when the answer
/// reads as clinical, and always appends the footer. Deterministic.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    clinical: Option<Regex>,
    redacted: Option<Regex>,
    disclaimer: String,
    footer: String,
}

impl PostProcessor {
    pub fn from_config(config: &SafetyConfig) -> Result<Self, Error> {
        Ok(Self {
            clinical: word_matcher(&config.clinical_terms)?,
            redacted: word_matcher(&config.redacted_terms)?,
            disclaimer: config.disclaimer.trim().to_string(),
            footer: config.footer.trim().to_string(),
        })
    }

    pub fn finalize(&self, answer: &str) -> Finalized {
        let mut redactions = 0;
        let mut text = match &self.redacted {
            Some(re) => {
                redactions = re.find_iter(answer).count();
                re.replace_all(answer, REDACTION).into_owned()
            }
            None => answer.to_string(),
        };
        text = text.trim_end().to_string();

        let clinical = self.clinical.as_ref().is_some_and(|re| re.is_match(&text));
        if clinical && !self.disclaimer.is_empty() {
            push_paragraph(&mut text, &self.disclaimer);
        }
        if !self.footer.is_empty() {
            push_paragraph(&mut text, &self.footer);
        }

        Finalized {
            text,
            clinical,
            redactions,
        }
    }
}

fn push_paragraph(text: &mut String, paragraph: &str) {
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(paragraph);
}

/// Case-insensitive whole-word alternation over `terms`, or `None` when the
/// list is empty.
fn word_matcher(terms: &[String]) -> Result<Option<Regex>, Error> {
    let escaped: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(regex_lite::escape)
        .collect();
    if escaped.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| Error::Internal(format!("invalid safety term list: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(redacted: &[&str]) -> PostProcessor {
        PostProcessor::from_config(&SafetyConfig {
            clinical_terms: vec!["fever".into(), "dosage".into()],
            redacted_terms: redacted.iter().map(|s| s.to_string()).collect(),
            disclaimer: "Not medical advice.".into(),
            footer: "Trust your instincts.".into(),
        })
        .unwrap()
    }

    #[test]
    fn footer_always_appended() {
        let out = processor(&[]).finalize("Try a bedtime story.\n");
        assert_eq!(out.text, "Try a bedtime story.\n\nTrust your instincts.");
        assert!(!out.clinical);
    }

    #[test]
    fn clinical_terms_add_disclaimer_before_footer() {
        let out = processor(&[]).finalize("A mild FEVER is common after shots.");
        assert!(out.clinical);
        assert_eq!(
            out.text,
            "A mild FEVER is common after shots.\n\nNot medical advice.\n\nTrust your instincts."
        );
    }

    #[test]
    fn terms_match_whole_words_only() {
        let out = processor(&[]).finalize("Feverish excitement before the party.");
        assert!(!out.clinical);
    }

    #[test]
    fn redacts_configured_terms() {
        let out = processor(&["stupid", "a.b"]).finalize("That is a Stupid idea, not a.b or axb.");
        assert_eq!(out.redactions, 2);
        assert!(out.text.starts_with("That is a [redacted] idea, not [redacted] or axb."));
    }

    #[test]
    fn deterministic() {
        let p = processor(&["bad"]);
        assert_eq!(p.finalize("bad fever"), p.finalize("bad fever"));
    }

    #[test]
    fn empty_answer_gets_footer_only() {
        assert_eq!(processor(&[]).finalize("").text, "Trust your instincts.");
    }
}
