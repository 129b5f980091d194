// src/ai/prompt.rs
//! Prompt builders and response parsing for the two AI tasks.

use serde::{Deserialize, Serialize};

use super::{Completion, EscalationError, Task};
use crate::model::{CategoryId, DetectionInput, KeywordType};

/// Threshold for resolving an unknown id by category name.
const NAME_MATCH_MIN: f64 = 0.93;
const MAX_FIELD_CHARS: usize = 600;

/// Category as offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: CategoryId,
    pub name: String,
    pub slug: String,
}

/// Validated selection. `category_id` is always one of the offered ids.
#[derive(Debug, Clone, PartialEq)]
pub struct AiSelection {
    pub category_id: CategoryId,
    pub category_name: String,
    pub category_slug: String,
    /// In [0,1].
    pub confidence: f32,
    pub reasoning: String,
    pub alternative_ids: Vec<CategoryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub category_id: CategoryId,
    pub category_name: String,
    #[serde(default)]
    pub category_slug: String,
    pub language: String,
    pub min_keywords: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKeyword {
    pub keyword: String,
    pub keyword_type: KeywordType,
    pub weight: Option<f32>,
    pub confidence: Option<f32>,
}

fn clip(s: &str) -> String {
    let t = s.trim();
    match t.char_indices().nth(MAX_FIELD_CHARS) {
        Some((i, _)) => t[..i].to_string(),
        None => t.to_string(),
    }
}

pub fn selection_prompt(input: &DetectionInput, candidates: &[CategoryRef]) -> Completion {
    let system = "You are a product categorization expert for an online marketplace. \
Pick the single most accurate category for the listing from the provided list. \
Answer with JSON only, no extra text."
        .to_string();

    let mut user = String::new();
    user.push_str("LISTING\n");
    user.push_str(&format!("Title: {}\n", clip(&input.title)));
    user.push_str(&format!("Description: {}\n", clip(&input.description)));
    if !input.keywords.is_empty() {
        user.push_str(&format!("Keywords: {}\n", input.keywords.join(", ")));
    }
    if let Some(d) = &input.domain {
        user.push_str(&format!("Domain hint: {d}\n"));
    }
    if let Some(p) = &input.product_type {
        user.push_str(&format!("Product type hint: {p}\n"));
    }
    for (k, v) in &input.attributes {
        user.push_str(&format!("Attribute {k}: {v}\n"));
    }

    user.push_str("\nCATEGORIES (one JSON object per line)\n");
    for c in candidates {
        let line = serde_json::json!({ "id": c.id, "name": c.name, "slug": c.slug });
        user.push_str(&line.to_string());
        user.push('\n');
    }

    user.push_str(
        "\nRespond with exactly this JSON shape:\n\
{\"categoryId\": 1234, \"categoryName\": \"...\", \"categorySlug\": \"...\", \
\"confidence\": 95.0, \"reasoning\": \"short explanation\", \"alternativeIds\": [12, 34]}\n\
confidence is a percentage between 0 and 100. categoryId must be one of the ids above.",
    );

    Completion {
        task: Task::SelectCategory,
        system,
        user,
        max_tokens: 500,
    }
}

pub fn generation_prompt(req: &GenerationRequest) -> Completion {
    let system = "You build keyword dictionaries for a marketplace category classifier. \
Answer with JSON only, no extra text."
        .to_string();
    let user = format!(
        "Category name: {name}\n\
Category slug: {slug}\n\
Language: {lang}\n\
\n\
Produce at least {min} distinct keywords in that language that a seller would use \
in a listing of this category: product names, brands, models, synonyms and common \
misspellings. Add a few negative keywords that indicate a different category.\n\
\n\
Respond with exactly this JSON shape:\n\
{{\"keywords\": [{{\"keyword\": \"...\", \"type\": \"main|synonym|negative\", \
\"weight\": 1.0, \"confidence\": 0.9}}]}}",
        name = clip(&req.category_name),
        slug = req.category_slug,
        lang = req.language,
        min = req.min_keywords,
    );
    Completion {
        task: Task::GenerateKeywords,
        system,
        user,
        max_tokens: 2_000,
    }
}

/// Outermost `{ ... }` of a reply that may be wrapped in prose or markdown.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSelection {
    #[serde(default)]
    category_id: Option<i64>,
    #[serde(default)]
    category_name: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    alternative_ids: Vec<i64>,
}

pub fn parse_selection(text: &str, offered: &[CategoryRef]) -> Result<AiSelection, EscalationError> {
    let json = extract_json_object(text)
        .ok_or_else(|| EscalationError::InvalidResponse("no JSON object in reply".into()))?;
    let raw: RawSelection = serde_json::from_str(json)
        .map_err(|e| EscalationError::InvalidResponse(format!("selection JSON: {e}")))?;

    let confidence = match raw.confidence {
        Some(c) if c.is_finite() && (0.0..=100.0).contains(&c) => {
            if c > 1.0 {
                c / 100.0
            } else {
                c
            }
        }
        Some(c) => {
            return Err(EscalationError::InvalidResponse(format!(
                "confidence out of range: {c}"
            )))
        }
        None => return Err(EscalationError::InvalidResponse("missing confidence".into())),
    };

    let by_id = raw
        .category_id
        .and_then(|id| offered.iter().find(|c| c.id == CategoryId(id)));
    let chosen = match by_id {
        Some(c) => c,
        None => raw
            .category_name
            .as_deref()
            .and_then(|name| closest_by_name(name, offered))
            .ok_or_else(|| {
                EscalationError::InvalidResponse(format!(
                    "category {:?} is not among the offered categories",
                    raw.category_id
                ))
            })?,
    };

    let alternative_ids = raw
        .alternative_ids
        .into_iter()
        .map(CategoryId)
        .filter(|id| *id != chosen.id && offered.iter().any(|c| c.id == *id))
        .collect();

    Ok(AiSelection {
        category_id: chosen.id,
        category_name: chosen.name.clone(),
        category_slug: chosen.slug.clone(),
        confidence: confidence as f32,
        reasoning: raw.reasoning.unwrap_or_default(),
        alternative_ids,
    })
}

fn closest_by_name<'a>(name: &str, offered: &'a [CategoryRef]) -> Option<&'a CategoryRef> {
    let wanted = name.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    offered
        .iter()
        .map(|c| (c, strsim::jaro_winkler(&wanted, &c.name.to_lowercase())))
        .filter(|(_, s)| *s >= NAME_MATCH_MIN)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c)
}

#[derive(Deserialize)]
struct RawKeyword {
    keyword: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    weight: Option<f32>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct RawKeywords {
    #[serde(default)]
    keywords: Vec<RawKeyword>,
}

/// Keywords from a generation reply. Blank entries are dropped; duplicates are
/// left to the store's dedup.
pub fn parse_keywords(text: &str) -> Result<Vec<GeneratedKeyword>, EscalationError> {
    let json = extract_json_object(text)
        .ok_or_else(|| EscalationError::InvalidResponse("no JSON object in reply".into()))?;
    let raw: RawKeywords = serde_json::from_str(json)
        .map_err(|e| EscalationError::InvalidResponse(format!("keywords JSON: {e}")))?;
    Ok(raw
        .keywords
        .into_iter()
        .filter(|k| !k.keyword.trim().is_empty())
        .map(|k| GeneratedKeyword {
            keyword: k.keyword.trim().to_string(),
            keyword_type: k
                .kind
                .as_deref()
                .map(KeywordType::parse_lenient)
                .unwrap_or(KeywordType::Main),
            weight: k.weight,
            confidence: k.confidence,
        })
        .collect())
}
