/// Rule-based review auto-classification
///
/// New discoveries get one shot at an automatic "Non Related" verdict from
/// a keyword scan over their rules and description. The verdict only ever
/// applies to subreddits with no review; a human classification is final.

use crate::models::{Review, SubredditRule};

/// Keywords that disqualify a subreddit from the crawl, grouped by the
/// content category they catch.
const NON_RELATED_KEYWORDS: &[&str] = &[
    // Hentai / drawn content
    "hentai",
    "anime porn",
    "rule34",
    "cartoon porn",
    "animated porn",
    "ecchi",
    "doujin",
    "drawn porn",
    "manga porn",
    "anime girls",
    "waifu",
    "2d girls",
    "anime babes",
    // Extreme or niche fetishes
    "bbw",
    "ssbbw",
    "feederism",
    "weight gain",
    "fat fetish",
    "scat",
    "watersports",
    "golden shower",
    "piss",
    "abdl",
    "diaper",
    "adult baby",
    "little space",
    "age play",
    "ddlg",
    "vore",
    "inflation",
    "transformation",
    "macro",
    "giantess",
    "furry",
    "yiff",
    "anthro",
    "fursuit",
    "anthropomorphic",
    "guro",
    "necro",
    "gore",
    "death",
    "snuff",
    "femdom",
    "findom",
    "financial domination",
    "paypig",
    "sissy",
    "pregnant",
    "breeding",
    "impregnation",
    "preggo",
    "cuckold",
    "cuck",
    "hotwife",
    "bull",
    "chastity",
    "denial",
    "locked",
    "keyholder",
    "ballbusting",
    "cbt",
    "cock torture",
    "latex",
    "rubber",
    "bondage gear",
    "bdsm equipment",
    // SFW-only communities that still require nudity
    "nudity is required",
    "nudity required",
    "must be nude",
    "nudity mandatory",
    "nude only",
    "nudity is mandatory",
    "requires nudity",
    "no clothes allowed",
    "must show nudity",
    "nude content only",
    "full nudity required",
    "complete nudity",
    // Professional / career
    "career advice",
    "job hunting",
    "resume help",
    "interview tips",
    "academic discussion",
    // Cooking
    "cooking recipes",
    "baking recipes",
    "meal prep recipes",
    // Gaming
    "pc master race",
    "console gaming discussion",
    "indie game development",
    // Politics / government
    "government policy",
    "election discussion",
    "political debate",
    "city council",
    "local government",
    // Animals / pets
    "veterinary advice",
    "pet care tips",
    "animal rescue",
    // Academic / research
    "scientific research",
    "academic papers",
    "peer review",
];

const VERIFICATION_KEYWORDS: &[&str] = &["verification", "verified", "verify"];

/// Scan rules + description for a disqualifying keyword.
///
/// Returns `Some(NonRelated)` on the first match, None when the subreddit
/// should wait for manual review. Never an error.
pub fn classify(rules_text: &str, description: &str) -> Option<Review> {
    if rules_text.is_empty() && description.is_empty() {
        return None;
    }

    let combined = format!("{} {}", rules_text, description).to_lowercase();
    for keyword in NON_RELATED_KEYWORDS {
        if combined.contains(keyword) {
            tracing::info!("auto-classified as Non Related: detected '{}'", keyword);
            return Some(Review::NonRelated);
        }
    }
    None
}

/// True when the rules or description mention a verification requirement
pub fn detect_verification(rules: &[SubredditRule], description: &str) -> bool {
    let search_text = format!("{} {}", combine_rules(rules), description).to_lowercase();
    VERIFICATION_KEYWORDS
        .iter()
        .any(|keyword| search_text.contains(keyword))
}

/// Concatenate rule descriptions into one searchable string
pub fn combine_rules(rules: &[SubredditRule]) -> String {
    rules
        .iter()
        .filter_map(|r| r.description.as_deref())
        .collect::<Vec<_>>()
        .join(" ")
}
