/// A research location and the names people use for it in free-text
/// profile locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationProfile {
    pub tag: String,
    pub aliases: Vec<String>,
}

impl LocationProfile {
    pub fn new(tag: impl Into<String>, aliases: &[&str]) -> Self {
        Self {
            tag: tag.into(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// True if the profile location names this research location: any
    /// candidate equals one of its tokens, or appears as a substring of the
    /// normalized text (multi-word aliases such as "port harcourt").
    pub fn matches(&self, profile_location: &str) -> bool {
        let tokens = tokenize(profile_location);
        if tokens.is_empty() {
            return false;
        }
        let normalized = tokens.join(" ");

        self.candidates().any(|candidate| {
            let candidate = tokenize(&candidate).join(" ");
            !candidate.is_empty()
                && (tokens.iter().any(|t| *t == candidate) || normalized.contains(&candidate))
        })
    }

    fn candidates(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.tag.replace(['_', '-'], " ")).chain(self.aliases.iter().cloned())
    }
}

/// Lowercase alphanumeric tokens of a free-text location.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Built-in profile for a research location tag. Unknown tags match only
/// their own name.
pub fn profile(tag: &str) -> LocationProfile {
    match tag {
        "lagos" => LocationProfile::new(tag, &["lagos", "lasgidi", "eko", "ikeja", "lekki"]),
        "nairobi" => LocationProfile::new(tag, &["nairobi", "nbo", "kenya"]),
        "accra" => LocationProfile::new(tag, &["accra", "ghana", "kumasi"]),
        "port_harcourt" => LocationProfile::new(tag, &["port harcourt", "portharcourt", "ph city"]),
        "johannesburg" => LocationProfile::new(tag, &["johannesburg", "joburg", "jozi", "jhb"]),
        other => LocationProfile::new(other, &[]),
    }
}
