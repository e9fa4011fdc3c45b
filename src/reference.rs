//! Model references are links to downloadable model archives.

use url::{Host, Url};

/// Whether `reference` is an absolute http(s) link the converter can fetch.
///
/// Bare model names are not accepted; the converter downloads the archive
/// itself and needs a full URL.
pub fn is_valid_reference(reference: &str) -> bool {
    if reference.is_empty() || reference.chars().any(char::is_whitespace) {
        return false;
    }

    // `Url::parse` tolerates `https:host` and similar; require the authority.
    let Some((scheme, _)) = reference.split_once("://") else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return false;
    }

    let Ok(url) = Url::parse(reference) else {
        return false;
    };

    match url.host() {
        Some(Host::Domain(domain)) => has_top_level_label(domain),
        Some(Host::Ipv4(_)) => true,
        Some(Host::Ipv6(_)) | None => false,
    }
}

fn has_top_level_label(domain: &str) -> bool {
    let Some((name, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !name.is_empty() && !tld.is_empty() && tld.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_model_links() {
        for reference in [
            "https://huggingface.co/user/model/resolve/main/model.zip",
            "http://www.example.com",
            "https://example.com/path?download=1&name=voice",
            "HTTPS://Example.COM/model.zip",
            "http://192.168.1.10:8080/model.zip",
            "https://user@host.io/model.zip",
        ] {
            assert!(is_valid_reference(reference), "{reference}");
        }
    }

    #[test]
    fn rejects_names_and_malformed_links() {
        for reference in [
            "",
            "my-voice-model",
            "huggingface.co/user/model.zip",
            "ftp://example.com/model.zip",
            "https:example.com/model.zip",
            "https://localhost/model.zip",
            "https://example./model.zip",
            "https://example.com/model name.zip",
            "https://[::1]/model.zip",
            "https://",
            "javascript://example.com/%0aalert(1)x",
        ] {
            assert!(!is_valid_reference(reference), "{reference}");
        }
    }
}
