//! Model-name tag handling.
//!
//! Model names carry an optional tag after a colon (`llama3:8b`,
//! `nomic-embed-text:latest`). A bare name refers to its `:latest` tag, so
//! matching has to treat `m` and `m:latest` as the same model while keeping
//! distinct tags apart.

/// Resolves a bare model name to its `:latest` tag.
///
/// Names that already carry a tag are returned unchanged.
///
/// # Examples
///
/// ```rust
/// use corral::utils::model_tag::resolve_tag;
///
/// assert_eq!(resolve_tag("llama3"), "llama3:latest");
/// assert_eq!(resolve_tag("llama3:8b"), "llama3:8b");
/// ```
pub fn resolve_tag(model: &str) -> String {
    if model.contains(':') {
        model.to_string()
    } else {
        format!("{}:latest", model)
    }
}

/// Whether two model names refer to the same model after tag resolution.
///
/// # Examples
///
/// ```rust
/// use corral::utils::model_tag::models_match;
///
/// assert!(models_match("llama3", "llama3:latest"));
/// assert!(models_match("llama3:8b", "llama3:8b"));
/// assert!(!models_match("llama3:8b", "llama3:70b"));
/// ```
pub fn models_match(a: &str, b: &str) -> bool {
    resolve_tag(a) == resolve_tag(b)
}
