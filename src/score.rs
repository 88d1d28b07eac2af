/// Ordered label -> score table. The first label contained in the text wins.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeLexicon {
    entries: Vec<(String, f64)>,
}

impl GradeLexicon {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(label, score)| (label.into(), score))
                .filter(|(label, _)| !label.is_empty())
                .collect(),
        }
    }

    // "不及格" contains "及格" and hits the 60 entry first.
    pub fn chinese() -> Self {
        Self::new([
            ("优秀", 95.0),
            ("优", 95.0),
            ("良好", 85.0),
            ("良", 85.0),
            ("中等", 75.0),
            ("中", 75.0),
            ("及格", 60.0),
            ("及", 60.0),
            ("不及格", 0.0),
            ("不及", 0.0),
        ])
    }

    pub fn english() -> Self {
        Self::new([
            ("excellent", 95.0),
            ("good", 85.0),
            ("average", 75.0),
            ("pass", 60.0),
            ("fail", 0.0),
        ])
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "zh" => Some(Self::chinese()),
            "en" => Some(Self::english()),
            _ => None,
        }
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn lookup(&self, text: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(label, _)| text.contains(label.as_str()))
            .map(|(_, score)| *score)
    }
}

impl Default for GradeLexicon {
    fn default() -> Self {
        Self::chinese()
    }
}

pub fn is_graded(raw: &str) -> bool {
    !raw.trim().is_empty()
}

/// Blank, then "a/b" composites (max of the parts), then lexicon labels, then
/// a plain number. Anything else is 0.0.
pub fn normalize(raw: &str, lexicon: &GradeLexicon) -> f64 {
    let value = raw.trim();
    if value.is_empty() {
        return 0.0;
    }

    if value.contains('/') {
        return value
            .split('/')
            .map(|part| normalize(part, lexicon))
            .fold(0.0, f64::max);
    }

    if let Some(score) = lexicon.lookup(value) {
        return score;
    }

    match fold_numeric(value).parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => v,
        _ => 0.0,
    }
}

// Full-width digits come from CJK input methods. Underscores are allowed
// between digits.
fn fold_numeric(value: &str) -> String {
    let chars: Vec<char> = value
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            '．' => '.',
            '＋' => '+',
            '－' => '-',
            _ => c,
        })
        .collect();
    chars
        .iter()
        .enumerate()
        .filter(|&(i, &c)| {
            let between_digits = i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            !(c == '_' && between_digits)
        })
        .map(|(_, &c)| c)
        .collect()
}
