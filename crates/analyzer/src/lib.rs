//! Page analysis: classification, link extraction, template/hub signals.
//!
//! DOM traversal and title/h1-h3/meta/og extraction go through
//! `scraper::Selector`, with ancestor walks for structural heuristics. Link
//! extraction resolves against the base URL and strips fragments; there is
//! no scheme branching beyond `http`/`https` since that is all this crawler
//! ever sees.

use newscrawler_core::{
    config::AnalyzerConfig, Classification, Confidence, HubCandidate, HubCandidateKind,
};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

#[derive(Debug, Clone)]
pub struct AnalyzedLink {
    pub url: String,
    pub anchor_text: Option<String>,
    pub is_nav_link: bool,
}

#[derive(Debug, Clone)]
pub struct TemplateCandidate {
    pub pattern: String,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub classification: Classification,
    pub title: Option<String>,
    pub canonical: Option<String>,
    pub word_count: usize,
    pub language: Option<String>,
    pub links: Vec<AnalyzedLink>,
    pub templates: Vec<TemplateCandidate>,
    pub hub_candidates: Vec<HubCandidate>,
    pub truncated: bool,
    pub error_msg: Option<String>,
}

impl AnalysisOutput {
    fn failed(error_msg: String) -> Self {
        Self {
            classification: Classification::Other,
            title: None,
            canonical: None,
            word_count: 0,
            language: None,
            links: Vec::new(),
            templates: Vec::new(),
            hub_candidates: Vec::new(),
            truncated: false,
            error_msg: Some(error_msg),
        }
    }
}

pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyzes `html` fetched from `final_url`. `known_templates` is the
    /// Intelligence-promoted pattern set for this domain, consulted by the
    /// article-classification rule. `truncated` carries forward the
    /// fetcher's over-cap flag so it survives into the output unchanged. On
    /// parse failure, classification defaults to `other` with `links` empty
    /// and `error_msg` set, per the documented error behavior.
    pub fn analyze(&self, html: &str, final_url: &Url, known_templates: &[String], truncated: bool) -> AnalysisOutput {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.analyze_inner(html, final_url, known_templates, truncated)
        }));

        match result {
            Ok(output) => output,
            Err(_) => AnalysisOutput::failed("html parsing panicked".to_string()),
        }
    }

    fn analyze_inner(&self, html: &str, final_url: &Url, known_templates: &[String], truncated: bool) -> AnalysisOutput {
        let document = Html::parse_document(html);

        let title = select_first_text(&document, "title");
        let canonical = select_attr(&document, "link[rel=canonical]", "href");
        let language = select_attr(&document, "html", "lang");

        let body_text = select_first_text(&document, "body").unwrap_or_default();
        let word_count = body_text.split_whitespace().count();

        let links = extract_links(&document, final_url, &self.config);
        let nav_ratio = nav_ratio(&links);
        let on_domain_count = links.len();

        let pattern = pattern_for_path(final_url.path());
        let templates = vec![TemplateCandidate { pattern: pattern.clone() }];

        let matches_known_template = known_templates.iter().any(|t| t == &pattern);

        let classification = if body_text.chars().count() > self.config.article_min_body_chars
            && matches_known_template
            && nav_ratio < self.config.nav_link_ratio_threshold
        {
            Classification::Article
        } else if on_domain_count > self.config.hub_min_outbound_links
            && nav_ratio > self.config.nav_link_ratio_threshold
        {
            Classification::Hub
        } else {
            Classification::Other
        };

        let hub_candidates = hub_candidates_for_path(final_url.path(), &self.config);

        AnalysisOutput {
            classification,
            title,
            canonical,
            word_count,
            language,
            links,
            templates,
            hub_candidates,
            truncated,
            error_msg: None,
        }
    }
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document.select(&sel).next().map(|el| {
        el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
    }).filter(|s| !s.is_empty())
}

fn select_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document.select(&sel).next().and_then(|el| el.value().attr(attr)).map(|s| s.to_string())
}

fn nav_ratio(links: &[AnalyzedLink]) -> f64 {
    if links.is_empty() {
        return 0.0;
    }
    let nav = links.iter().filter(|l| l.is_nav_link).count();
    nav as f64 / links.len() as f64
}

fn extract_links(document: &Html, base_url: &Url, config: &AnalyzerConfig) -> Vec<AnalyzedLink> {
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            if href.starts_with("javascript:")
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with('#')
            {
                return None;
            }

            let mut resolved = base_url.join(href).ok()?;
            if resolved.host_str() != base_url.host_str() {
                return None;
            }
            resolved.set_fragment(None);

            let anchor_text = el.text().collect::<String>().trim().to_string();
            Some(AnalyzedLink {
                url: resolved.to_string(),
                anchor_text: if anchor_text.is_empty() { None } else { Some(anchor_text) },
                is_nav_link: is_nav_link(el, config),
            })
        })
        .collect()
}

fn is_nav_link(el: ElementRef, config: &AnalyzerConfig) -> bool {
    for ancestor in el.ancestors() {
        if let Some(ancestor_el) = ElementRef::wrap(ancestor) {
            if matches!(ancestor_el.value().name(), "nav" | "header" | "footer" | "aside") {
                return true;
            }
        }
    }

    if let Some(parent) = el.parent().and_then(ElementRef::wrap) {
        let sibling_anchor_count = parent
            .children()
            .filter(|c| ElementRef::wrap(*c).map(|e| e.value().name() == "a").unwrap_or(false))
            .count();
        if sibling_anchor_count > config.anchor_dense_count {
            return true;
        }
    }

    false
}

static DATE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").unwrap());
static MONTH_OR_DAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}$").unwrap());
static ID_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static LANG_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]{2}(-[A-Z]{2})?$").unwrap());

/// Replaces path segments with typed placeholders.
fn pattern_for_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < segments.len() {
        if i + 2 < segments.len()
            && DATE_SEGMENT.is_match(segments[i])
            && MONTH_OR_DAY.is_match(segments[i + 1])
            && MONTH_OR_DAY.is_match(segments[i + 2])
        {
            out.push("{date}".to_string());
            i += 3;
            continue;
        }

        let seg = segments[i];
        if ID_SEGMENT.is_match(seg) {
            out.push("{id}".to_string());
        } else if LANG_SEGMENT.is_match(seg) {
            out.push("{lang}".to_string());
        } else if seg.len() > 3 && (seg.contains('-') || seg.chars().any(|c| c.is_ascii_digit())) {
            out.push("{slug}".to_string());
        } else {
            out.push(seg.to_string());
        }
        i += 1;
    }
    format!("/{}", out.join("/"))
}

/// Place/topic-hub signal detection.
fn hub_candidates_for_path(path: &str, config: &AnalyzerConfig) -> Vec<HubCandidate> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some(first) = segments.first() else {
        return Vec::new();
    };
    if segments.len() < 2 {
        return Vec::new();
    }

    if !config.hub_indicator_segments.iter().any(|s| s == first) {
        return Vec::new();
    }

    let confirmed = config.known_section_dictionary.iter().any(|s| s == first);
    let kind = if confirmed { HubCandidateKind::TopicHub } else { HubCandidateKind::PlaceHub };
    let confidence = if confirmed { Confidence::Confirmed } else { Confidence::Probable };

    vec![HubCandidate { kind, segment: first.to_string(), confidence }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AnalyzerConfig {
        AnalyzerConfig {
            article_min_body_chars: 500,
            nav_link_ratio_threshold: 0.5,
            hub_min_outbound_links: 10,
            anchor_dense_count: 8,
            hub_indicator_segments: vec!["world".into(), "news".into(), "section".into()],
            known_section_dictionary: vec!["world".into(), "politics".into(), "business".into()],
        }
    }

    #[test]
    fn pattern_for_path_replaces_numeric_and_slug_segments() {
        assert_eq!(pattern_for_path("/world/my-story-123"), "/world/{slug}");
        assert_eq!(pattern_for_path("/2024/01/12/my-story"), "/{date}/{slug}");
        assert_eq!(pattern_for_path("/article/98765"), "/article/{id}");
    }

    #[test]
    fn hub_candidate_confirmed_when_in_dictionary() {
        let cfg = cfg();
        let candidates = hub_candidates_for_path("/world/europe", &cfg);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].confidence, Confidence::Confirmed);
        assert_eq!(candidates[0].kind, HubCandidateKind::TopicHub);
    }

    #[test]
    fn hub_candidate_probable_when_not_in_dictionary() {
        let cfg = cfg();
        let candidates = hub_candidates_for_path("/section/local", &cfg);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].confidence, Confidence::Probable);
    }

    #[test]
    fn no_hub_candidate_for_unrecognized_prefix() {
        let cfg = cfg();
        assert!(hub_candidates_for_path("/about/contact", &cfg).is_empty());
    }

    #[test]
    fn analyze_classifies_hub_page_with_many_links() {
        let analyzer = Analyzer::new(cfg());
        let mut links_html = String::new();
        for i in 0..15 {
            links_html.push_str(&format!("<a href=\"/world/story-{i}\">story {i}</a>"));
        }
        let html = format!("<html><body><nav>{links_html}</nav></body></html>");
        let base = Url::parse("https://example.invalid/world").unwrap();
        let out = analyzer.analyze(&html, &base, &[], false);
        assert_eq!(out.classification, Classification::Hub);
        assert_eq!(out.links.len(), 15);
        assert!(out.links.iter().all(|l| l.is_nav_link));
    }

    #[test]
    fn analyze_classifies_article_when_template_known() {
        let analyzer = Analyzer::new(cfg());
        let body = "word ".repeat(200);
        let html = format!("<html><body><p>{body}</p></body></html>");
        let base = Url::parse("https://example.invalid/world/my-big-story").unwrap();
        let known = vec!["/world/{slug}".to_string()];
        let out = analyzer.analyze(&html, &base, &known, false);
        assert_eq!(out.classification, Classification::Article);
    }

    #[test]
    fn analyze_drops_cross_origin_and_non_http_links() {
        let analyzer = Analyzer::new(cfg());
        let html = r#"<html><body>
            <a href="https://other.invalid/x">ext</a>
            <a href="mailto:a@b.com">mail</a>
            <a href="/local/story">local</a>
        </body></html>"#;
        let base = Url::parse("https://example.invalid/").unwrap();
        let out = analyzer.analyze(html, &base, &[], false);
        assert_eq!(out.links.len(), 1);
        assert!(out.links[0].url.contains("/local/story"));
    }

    #[test]
    fn analyze_carries_truncated_flag_into_output() {
        let analyzer = Analyzer::new(cfg());
        let html = "<html><body><p>partial page cut off mid</p></body>";
        let base = Url::parse("https://example.invalid/world/story").unwrap();
        let out = analyzer.analyze(html, &base, &[], true);
        assert!(out.truncated);
    }
}
