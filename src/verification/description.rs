// src/verification/description.rs
//
// Structured view of a free-text vehicle description ("2019 red VW Golf GTI
// hatchback" -> make volkswagen, model [golf], colour red, year 2019).
// Sent to remote verifiers next to the raw description so both engines
// see the same canonical make and colour.

use serde::Serialize;

const BODY_WORDS: &[&str] = &[
    "sedan", "coupe", "convertible", "wagon", "hatchback", "suv", "van", "cab", "crew", "regular",
    "extended", "cargo", "minivan", "roadster", "cabriolet", "car", "truck",
];

const TRIM_WORDS: &[&str] = &[
    "hybrid", "sport", "gt", "ss", "srt", "rt", "lx", "ex", "v8", "v6", "v12", "db9", "zr1", "z06",
    "xkr", "xk", "touring", "supersports", "super", "gti", "hse", "awd", "ff", "xl", "xlt", "lt",
    "ls", "sv", "rs", "rsx", "type", "series", "class",
];

const COLOURS: &[&str] = &[
    "black", "white", "silver", "grey", "gray", "blue", "red", "green", "yellow", "gold", "orange",
    "brown", "beige", "maroon", "pink", "purple", "burgundy", "tan", "teal",
];

const MAKE_SYNONYMS: &[(&str, &str)] = &[
    ("vw", "volkswagen"),
    ("volkswagon", "volkswagen"),
    ("chevy", "chevrolet"),
    ("mb", "mercedes-benz"),
    ("mercedes", "mercedes-benz"),
    ("merc", "mercedes-benz"),
    ("rr", "rolls-royce"),
    ("land", "land-rover"),
    ("rover", "land-rover"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedDescription {
    pub make: String,
    pub model_tokens: Vec<String>,
    pub colour: Option<String>,
    pub year: Option<u16>,
}

impl NormalizedDescription {
    /// Returns `None` when nothing but colour/body/trim words is left.
    pub fn parse(text: &str) -> Option<Self> {
        let lowered = text.to_lowercase();
        let cleaned: String = lowered
            .chars()
            .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { ' ' })
            .collect();

        let mut year = None;
        let mut colour = None;
        let mut kept: Vec<&str> = Vec::new();

        for token in cleaned.split_whitespace() {
            if token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()) {
                if year.is_none() {
                    year = token.parse().ok();
                }
                continue;
            }
            if colour.is_none() && COLOURS.contains(&token) {
                colour = Some(token.to_string());
                continue;
            }
            if BODY_WORDS.contains(&token) || TRIM_WORDS.contains(&token) {
                continue;
            }
            kept.push(token);
        }

        let (first, rest) = kept.split_first()?;
        let make = MAKE_SYNONYMS
            .iter()
            .find(|(alias, _)| alias == first)
            .map_or(*first, |(_, canonical)| *canonical)
            .to_string();

        // "land rover" and "mercedes benz" name one make, not make + model.
        let model_tokens = rest
            .iter()
            .skip_while(|t| make.split('-').skip(1).any(|part| part == **t))
            .map(|t| t.to_string())
            .collect();

        Some(Self {
            make,
            model_tokens,
            colour,
            year,
        })
    }
}
