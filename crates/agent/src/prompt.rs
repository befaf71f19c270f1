//! Prompt assembly.
//!
//! Mode-specific system prompts with the constitutional rule lists, the JSON
//! schema block when structured output is on, the retrieved few-shot example
//! block behind the `{{CONSTITUTIONAL_EXAMPLES}}` placeholder, and the source
//! context block.

use serde_json::Value;

use lagrum_core::ResponseMode;
use lagrum_rag::SearchResult;

/// Fixed response templates.
pub struct ResponseTemplates;

impl ResponseTemplates {
    /// EVIDENCE refusal, verbatim contract.
    pub const EVIDENCE_REFUSAL: &'static str =
        "Tyvärr kan jag inte besvara frågan utifrån de dokument som har hämtats i den här sökningen. \
         Underlag saknas för att ge ett rättssäkert svar, och jag kan därför inte spekulera. \
         Om du vill kan du omformulera frågan eller ange vilka dokument/avsnitt du vill att jag ska söker i.";

    /// ASSIST safe fallback when structured output cannot be recovered.
    pub const SAFE_FALLBACK: &'static str =
        "Jag kunde inte tolka modellens strukturerade svar. Försök igen.";

    /// Strict-JSON retry instruction after a parse/validation failure.
    pub const STRUCTURED_RETRY_INSTRUCTION: &'static str =
        "Du returnerade ogiltig JSON. Returnera endast giltig JSON enligt schema, \
         inga backticks, ingen extra text.";

    /// Generic error answer for unexpected pipeline failures.
    pub const PIPELINE_ERROR: &'static str =
        "Tyvärr uppstod ett fel vid svarandet på din fråga.";
}

/// Placeholder replaced with retrieved few-shot examples.
pub const EXAMPLES_PLACEHOLDER: &str = "{{CONSTITUTIONAL_EXAMPLES}}";

const BASE_EVIDENCE: &str = "Du är en AI-assistent inom en svensk myndighet. Din uppgift är att besvara användarens fråga enbart utifrån tillgängliga dokument och källor. KONSTITUTIONELLA REGLER: 1. Legalitet: Du får INTE använda information som inte uttryckligen stöds av de dokument som hämtats. 2. Transparens: Alla påståenden måste ha en källhänvisning. Om en uppgift saknas i dokumenten, svara ärligt att underlag saknas. Spekulera aldrig. 3. Objektivitet: Var neutral, saklig och formell. Undvik värdeladdade ord. Svara på svenska.";

const BASE_ASSIST: &str = "Du är en AI-assistent inom en svensk myndighet. Du ska vara hjälpsam och pedagogisk i enlighet med serviceskyldigheten i förvaltningslagen. KONSTITUTIONELLA REGLER: 1. Pedagogik: Du får använda din allmänna kunskap för att förklara begrepp och sammanhang. 2. Källkritik: Du måste tydligt skilja på vad som är verifierade fakta från dokument (ange källa) och vad som är dina egna förklaringar. 3. Tonalitet: Var artig och tillgänglig, men behåll en professionell myndighetston. Svara på svenska.";

const CHAT_PROMPT: &str = "Avslappnad AI-assistent. Svara kort på svenska.\nMAX 2-3 meningar. INGEN MARKDOWN - skriv ren text utan *, **, #, -, eller listor.\n\nOm frågan handlar om svensk lag eller myndighetsförvaltning, kan du hänvisa till att du har tillgång till en korpus med svenska myndighetsdokument, men svara kortfattat.";

const JSON_INSTRUCTION: &str = r#"
Du måste svara i strikt JSON enligt detta schema:
{
  "mode": "EVIDENCE" | "ASSIST",
  "saknas_underlag": boolean,
  "svar": string,
  "kallor": [{"doc_id": string, "chunk_id": string, "citat": string, "loc": string}],
  "fakta_utan_kalla": [string],
  "arbetsanteckning": string
}

Regler:
- I EVIDENCE: "fakta_utan_kalla" måste vara tom. Om du saknar stöd: sätt "saknas_underlag": true och skriv refusal-svar i "svar". Alla påståenden citerar [Källa N]. Författningsnummer återges ordagrant när de förekommer.
- I ASSIST: Fakta från dokument ska ha källa. Allmän kunskap ska inte få en låtsaskälla; skriv då i "fakta_utan_kalla" kort vad som är allmän förklaring.
- "arbetsanteckning" får bara vara en mycket kort kontrollnotis. Den kommer inte visas för användaren."#;

const TEXT_INSTRUCTION: &str = "\nOm du saknar stöd för svaret i dokumenten, svara tydligt att du saknar underlag för att ge ett rättssäkert svar. Spekulera aldrig. Var neutral, saklig och formell. Svara kortfattat på svenska.";

/// Build the source context block: one header line per source with priority
/// marker and relevance, followed by the snippet.
pub fn build_context(sources: &[SearchResult]) -> String {
    if sources.is_empty() {
        return "Inga relevanta källor hittades i korpusen.".to_string();
    }

    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let doc_type = source.doc_type.as_deref().unwrap_or("okänt");
            let priority_marker = if doc_type == "sfs" {
                "⭐ PRIORITET (SFS)".to_string()
            } else {
                format!("Typ: {}", doc_type.to_uppercase())
            };
            format!(
                "[Källa {}: {}] {} | Relevans: {:.2}\n{}",
                i + 1,
                source.title,
                priority_marker,
                source.score,
                source.snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the mode system prompt. The examples placeholder stays in the text;
/// the caller substitutes it once the few-shot examples are retrieved.
pub fn build_system_prompt(
    mode: ResponseMode,
    context_text: &str,
    structured_output_enabled: bool,
) -> String {
    match mode {
        ResponseMode::Chat => CHAT_PROMPT.to_string(),
        ResponseMode::Evidence | ResponseMode::Assist => {
            let base = if mode == ResponseMode::Evidence { BASE_EVIDENCE } else { BASE_ASSIST };
            let instruction =
                if structured_output_enabled { JSON_INSTRUCTION } else { TEXT_INSTRUCTION };
            format!("{base}{instruction}{EXAMPLES_PLACEHOLDER}\n\nKälla från korpusen:\n{context_text}")
        }
    }
}

/// Format retrieved few-shot examples for the placeholder. Each example is a
/// JSON object with `user` and `assistant` fields.
pub fn format_examples(examples: &[Value]) -> String {
    if examples.is_empty() {
        return String::new();
    }

    let rule = "=".repeat(60);
    let formatted: Vec<String> = examples
        .iter()
        .enumerate()
        .map(|(i, example)| {
            let user = example.get("user").and_then(Value::as_str).unwrap_or("");
            let assistant = example
                .get("assistant")
                .map(|a| serde_json::to_string_pretty(a).unwrap_or_default())
                .unwrap_or_default();
            format!("Exempel {}:\nAnvändare: {user}\nAssistent: {assistant}\n", i + 1)
        })
        .collect();

    format!(
        "\n{rule}\nKONSTITUTIONELLA EXEMPEL (Följ dessa som mallar för ton och format):\n{rule}\n{}\n{rule}\n",
        formatted.join("\n")
    )
}

/// Substitute the examples placeholder.
pub fn insert_examples(system_prompt: &str, examples_text: &str) -> String {
    system_prompt.replace(EXAMPLES_PLACEHOLDER, examples_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagrum_rag::RetrieverTag;
    use serde_json::json;

    fn source(title: &str, doc_type: &str, score: f32) -> SearchResult {
        SearchResult {
            id: "id".to_string(),
            title: title.to_string(),
            snippet: "utdrag ur dokumentet".to_string(),
            score,
            source: "coll".to_string(),
            doc_type: Some(doc_type.to_string()),
            date: None,
            retriever: RetrieverTag::Dense,
            tier: None,
            original_score: None,
            query_appearances: None,
        }
    }

    #[test]
    fn test_context_block_format() {
        let sources = vec![source("Regeringsformen", "sfs", 0.87), source("SOU 2020:1", "sou", 0.55)];
        let context = build_context(&sources);
        assert!(context.contains("[Källa 1: Regeringsformen] ⭐ PRIORITET (SFS) | Relevans: 0.87"));
        assert!(context.contains("[Källa 2: SOU 2020:1] Typ: SOU | Relevans: 0.55"));
    }

    #[test]
    fn test_context_block_empty() {
        assert_eq!(build_context(&[]), "Inga relevanta källor hittades i korpusen.");
    }

    #[test]
    fn test_evidence_prompt_contains_rules_and_schema() {
        let prompt = build_system_prompt(ResponseMode::Evidence, "ctx", true);
        assert!(prompt.contains("KONSTITUTIONELLA REGLER"));
        assert!(prompt.contains("Legalitet"));
        assert!(prompt.contains("saknas_underlag"));
        assert!(prompt.contains(EXAMPLES_PLACEHOLDER));
        assert!(prompt.ends_with("Källa från korpusen:\nctx"));
    }

    #[test]
    fn test_assist_prompt_without_structured_output() {
        let prompt = build_system_prompt(ResponseMode::Assist, "ctx", false);
        assert!(prompt.contains("serviceskyldigheten"));
        assert!(!prompt.contains("strikt JSON"));
        assert!(prompt.contains("rättssäkert svar"));
    }

    #[test]
    fn test_chat_prompt_plain() {
        let prompt = build_system_prompt(ResponseMode::Chat, "", true);
        assert!(prompt.contains("MAX 2-3 meningar"));
        assert!(!prompt.contains(EXAMPLES_PLACEHOLDER));
    }

    #[test]
    fn test_format_examples() {
        let examples = vec![json!({
            "user": "Vad säger RF?",
            "assistant": {"mode": "EVIDENCE", "svar": "..."}
        })];
        let text = format_examples(&examples);
        assert!(text.contains("KONSTITUTIONELLA EXEMPEL"));
        assert!(text.contains("Exempel 1:"));
        assert!(text.contains("Vad säger RF?"));
    }

    #[test]
    fn test_format_examples_empty() {
        assert_eq!(format_examples(&[]), "");
    }

    #[test]
    fn test_insert_examples_removes_placeholder() {
        let prompt = build_system_prompt(ResponseMode::Evidence, "ctx", true);
        let inserted = insert_examples(&prompt, "");
        assert!(!inserted.contains(EXAMPLES_PLACEHOLDER));
    }

    #[test]
    fn test_refusal_template_verbatim() {
        assert!(ResponseTemplates::EVIDENCE_REFUSAL
            .starts_with("Tyvärr kan jag inte besvara frågan utifrån de dokument"));
        assert!(ResponseTemplates::EVIDENCE_REFUSAL.contains("rättssäkert svar"));
    }
}
