/// Response body rewriting for REVERSE_PROXY mode
///
/// Textual bodies are scanned for the backend's own origin (absolute and
/// protocol-relative forms) and every occurrence is replaced with the public
/// endpoint base, so links and API references keep working through the proxy.
use aho_corasick::{AhoCorasick, MatchKind};
use lazy_static::lazy_static;

use crate::core::Backend;

/// Content-type markers that identify rewritable text
const TEXTUAL_MARKERS: &[&str] = &[
    "text/",
    "html",
    "json",
    "xml",
    "javascript",
    "ecmascript",
    "urlencoded",
    "csv",
];

lazy_static! {
    static ref TEXTUAL_FINDER: AhoCorasick = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(TEXTUAL_MARKERS)
        .expect("Failed to create textual content-type finder");
}

/// Whether a Content-Type value denotes a body worth rewriting
pub fn is_textual_content_type(content_type: &str) -> bool {
    TEXTUAL_FINDER.is_match(content_type)
}

/// Origin spellings a backend may use for itself inside a body. Longest
/// first so the matcher prefers the port-qualified forms.
pub(crate) fn origin_variants(backend: &Backend) -> Vec<String> {
    let mut variants = vec![
        format!("{}://{}:{}", backend.protocol, backend.host, backend.port),
        format!("//{}:{}", backend.host, backend.port),
    ];
    if backend.port == backend.protocol.default_port() {
        variants.push(format!("{}://{}", backend.protocol, backend.host));
        variants.push(format!("//{}", backend.host));
    }
    variants
}

/// Replace every backend-origin occurrence with the public endpoint base
pub fn rewrite_body(body: &str, backend: &Backend, public_base: &str) -> String {
    let patterns = origin_variants(backend);
    let finder = match AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(&patterns)
    {
        Ok(finder) => finder,
        Err(err) => {
            log::warn!("Body rewrite matcher build failed: {}", err);
            return body.to_string();
        }
    };

    let replacements: Vec<&str> = patterns.iter().map(|_| public_base).collect();
    finder.replace_all(body, &replacements)
}
