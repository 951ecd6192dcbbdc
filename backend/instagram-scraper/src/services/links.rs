/// External URL classification and caption parsing
///
/// Pure helpers: URL → link-type tag, bio-link extraction, hashtag and
/// mention extraction from captions.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::{BioLink, RawBioLink};

/// Classify an external URL by substring match, in fixed priority order.
pub fn identify_external_url_type(url: &str) -> Option<&'static str> {
    if url.is_empty() {
        return None;
    }

    let url = url.to_lowercase();

    let tag = if url.contains("onlyfans.com") {
        "onlyfans"
    } else if url.contains("linktr.ee") || url.contains("linktree") {
        "linktree"
    } else if url.contains("allmylinks") || url.contains("all.my") {
        "allmylinks"
    } else if url.contains("beacons.ai") {
        "beacons"
    } else if url.contains("bio.link") {
        "biolink"
    } else if url.contains("fans.ly") || url.contains("fansly") {
        "fansly"
    } else if url.contains("mym.fans") {
        "mym"
    } else if url.contains("patreon.com") {
        "patreon"
    } else if url.contains("cashapp") || url.contains("cash.app") {
        "cashapp"
    } else if url.contains("paypal") {
        "paypal"
    } else if url.contains("twitter.com") || url.contains("x.com") {
        "twitter"
    } else if url.contains("youtube.com") || url.contains("youtu.be") {
        "youtube"
    } else if url.contains("tiktok.com") {
        "tiktok"
    } else if url.contains("snapchat.com") {
        "snapchat"
    } else if url.contains("telegram") || url.contains("t.me") {
        "telegram"
    } else if url.contains("discord") {
        "discord"
    } else if [".com", ".net", ".org", ".io", ".co"]
        .iter()
        .any(|ext| url.contains(ext))
    {
        "personal_site"
    } else {
        "other"
    };

    Some(tag)
}

/// Parse and classify the profile's bio links
pub fn extract_bio_links(raw: &[RawBioLink]) -> Vec<BioLink> {
    raw.iter()
        .map(|link| {
            let url = link.url.clone().unwrap_or_default();
            BioLink {
                link_type: identify_external_url_type(&url).map(String::from),
                url,
                title: link.title.clone().unwrap_or_default(),
            }
        })
        .collect()
}

fn hashtag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#[A-Za-z0-9_]+").expect("valid hashtag regex"))
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@[A-Za-z0-9_.]+").expect("valid mention regex"))
}

/// Hashtags in a caption, `#` included
pub fn extract_hashtags(text: &str) -> Vec<String> {
    hashtag_re()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Mentions in a caption, `@` included
pub fn extract_mentions(text: &str) -> Vec<String> {
    mention_re()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_platforms_classify_first() {
        assert_eq!(
            identify_external_url_type("https://onlyfans.com/someone"),
            Some("onlyfans")
        );
        assert_eq!(
            identify_external_url_type("https://linktr.ee/someone"),
            Some("linktree")
        );
        assert_eq!(
            identify_external_url_type("https://www.patreon.com/x"),
            Some("patreon")
        );
        assert_eq!(identify_external_url_type("https://t.me/chan"), Some("telegram"));
    }

    #[test]
    fn priority_order_wins_over_generic_tld() {
        // onlyfans.com also contains ".com" but classifies as onlyfans
        assert_eq!(
            identify_external_url_type("https://onlyfans.com/a"),
            Some("onlyfans")
        );
    }

    #[test]
    fn unknown_domains_fall_back() {
        assert_eq!(
            identify_external_url_type("https://my-portfolio.io"),
            Some("personal_site")
        );
        assert_eq!(identify_external_url_type("ftp://weird"), Some("other"));
        assert_eq!(identify_external_url_type(""), None);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(
            identify_external_url_type("HTTPS://OnlyFans.com/X"),
            Some("onlyfans")
        );
    }

    #[test]
    fn bio_links_carry_types() {
        let raw = vec![
            RawBioLink {
                url: Some("https://fansly.com/a".into()),
                title: Some("my fansly".into()),
            },
            RawBioLink {
                url: None,
                title: None,
            },
        ];
        let links = extract_bio_links(&raw);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].link_type, Some("fansly".to_string()));
        assert_eq!(links[1].link_type, None);
    }

    #[test]
    fn hashtags_and_mentions() {
        let caption = "new drop #fitness #gym_life with @some.pal and @other_one!";
        assert_eq!(extract_hashtags(caption), vec!["#fitness", "#gym_life"]);
        assert_eq!(extract_mentions(caption), vec!["@some.pal", "@other_one"]);
        assert!(extract_hashtags("no tags here").is_empty());
    }
}
