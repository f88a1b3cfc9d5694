use dealcrawl_core::DealCandidate;
use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref"];

/// Deterministic identity of a candidate within one merchant.
pub trait NaturalKeyStrategy: Send + Sync {
    /// `landing_url` is the candidate's already-validated landing URL.
    fn natural_key(&self, candidate: &DealCandidate, landing_url: &Url) -> String;
}

/// Default strategy: sha256 of the normalized title and canonical landing URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct TitleUrlKey;

impl NaturalKeyStrategy for TitleUrlKey {
    fn natural_key(&self, candidate: &DealCandidate, landing_url: &Url) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_title(&candidate.title).as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_url(landing_url).as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub fn normalize_title(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strips fragments and tracking parameters, sorts the query and drops a trailing slash.
pub fn canonical_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}
