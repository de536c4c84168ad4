use std::cmp::Ordering;

/// The site-wide default language. Requests preferring it fall through to
/// the unprefixed path.
pub const DEFAULT_LANG: &str = "en";

/// Countries that fall back to pan-Latin-American Spanish.
const ES_419_COUNTRIES: &[&str] = &[
    "ar", "bo", "cl", "co", "cr", "do", "ec", "fk", "gf", "gt", "gy", "hn", "mx", "ni", "pa",
    "pe", "pr", "py", "sr", "sv", "uy", "ve",
];

/// Written-Chinese fallbacks for spoken-locale Accept-Language values.
fn cjk_fallbacks(lang: &str) -> &'static [&'static str] {
    match lang {
        "zh-cn" => &["zh-hans", "zh-hant", "zh"],
        "zh-hk" => &["zh-hant", "zh"],
        "zh-tw" => &["zh-hant", "zh"],
        _ => &[],
    }
}

/// De-facto official languages by country, in population order. This is a
/// static stand-in for a CLDR lookup; countries not listed contribute no
/// fallback languages.
fn country_languages(country: &str) -> &'static [&'static str] {
    match country {
        "us" | "gb" | "au" | "nz" => &["en"],
        "ie" => &["en", "ga"],
        "ca" => &["en", "fr"],
        "fr" => &["fr"],
        "de" | "at" => &["de"],
        "ch" => &["de", "fr", "it"],
        "be" => &["nl", "fr", "de"],
        "nl" => &["nl"],
        "es" | "mx" | "ar" | "co" | "cl" | "pe" | "ve" | "uy" | "py" | "bo" | "ec" | "gt"
        | "cr" | "pa" | "do" | "hn" | "ni" | "sv" => &["es"],
        "it" => &["it"],
        "pt" | "br" => &["pt"],
        "jp" => &["ja"],
        "kr" => &["ko"],
        "ru" => &["ru"],
        "ua" => &["uk"],
        "pl" => &["pl"],
        "cz" => &["cs"],
        "se" => &["sv"],
        "no" => &["nb"],
        "dk" => &["da"],
        "fi" => &["fi", "sv"],
        "tr" => &["tr"],
        "gr" => &["el"],
        "il" => &["he"],
        "sa" | "ae" | "eg" => &["ar"],
        "in" => &["hi", "en"],
        "id" => &["id"],
        "th" => &["th"],
        "vn" => &["vi"],
        "my" => &["ms"],
        "ph" => &["fil", "en"],
        "sg" => &["en", "ms", "ta"],
        _ => &[],
    }
}

/// Parse an Accept-Language header into lowercased language tags sorted by
/// q-value, descending; header order breaks ties. Wildcards and q=0
/// entries are dropped.
pub fn parse_accept_language(header: &str) -> Vec<String> {
    let mut entries: Vec<(f32, usize, String)> = Vec::new();
    for (index, item) in header.split(',').enumerate() {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (lang, quality) = match item.split_once(';') {
            Some((lang, params)) => {
                let mut quality = 1.0f32;
                for param in params.split(';') {
                    if let Some(value) = param.trim().strip_prefix("q=") {
                        quality = value.trim().parse().unwrap_or(1.0);
                    }
                }
                (lang.trim(), quality)
            }
            None => (item, 1.0),
        };
        if lang.is_empty() || lang == "*" || quality <= 0.0 {
            continue;
        }
        entries.push((quality, index, lang.to_ascii_lowercase()));
    }
    entries.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    entries.into_iter().map(|(_, _, lang)| lang).collect()
}

fn push_unique(langs: &mut Vec<String>, lang: &str) {
    if !langs.iter().any(|existing| existing == lang) {
        langs.push(lang.to_string());
    }
}

/// Build the ordered fallback-language list for a request: `hl` first (plus
/// its primary subtag), then Accept-Language values (with CJK fallbacks),
/// then the country's de-facto languages, then the default.
pub fn fallback_languages(hl: &str, accept_language: Option<&str>, country: &str) -> Vec<String> {
    let mut langs: Vec<String> = Vec::new();

    if !hl.is_empty() {
        push_unique(&mut langs, hl);
        if let Some((primary, _)) = hl.split_once('-') {
            push_unique(&mut langs, primary);
        }
    }

    if let Some(header) = accept_language {
        for lang in parse_accept_language(header) {
            push_unique(&mut langs, &lang);
            for fallback in cjk_fallbacks(&lang) {
                push_unique(&mut langs, fallback);
            }
        }
    }

    match country {
        "cn" => {
            for lang in ["zh-cn", "zh-hans", "zh-hant", "zh"] {
                push_unique(&mut langs, lang);
            }
        }
        "hk" => {
            for lang in ["zh-hk", "zh-hant", "zh"] {
                push_unique(&mut langs, lang);
            }
        }
        "tw" => {
            for lang in ["zh-tw", "zh-hant", "zh"] {
                push_unique(&mut langs, lang);
            }
        }
        other => {
            for lang in country_languages(other) {
                push_unique(&mut langs, lang);
            }
        }
    }
    if ES_419_COUNTRIES.contains(&country) {
        push_unique(&mut langs, "es-419");
    }

    push_unique(&mut langs, DEFAULT_LANG);
    langs
}

fn apply_format(format: &str, locale: &str, path: &str) -> String {
    format.replace("{locale}", locale).replace("{path}", path)
}

/// Emit the ordered locale candidate paths for an HTML request. Country
/// variants come first, then bare languages, with the unprefixed path
/// interleaved at the default language's position. The first candidate
/// present in the manifest wins.
pub fn intl_path_candidates(
    format: &str,
    path: &str,
    hl: &str,
    accept_language: Option<&str>,
    country: &str,
) -> Vec<String> {
    let langs = fallback_languages(hl, accept_language, country);
    let mut candidates = Vec::with_capacity(langs.len() * 3 + 1);

    for lang in &langs {
        candidates.push(apply_format(format, &format!("{lang}_{country}"), path));
        if lang.contains('-') {
            let underscored = lang.replace('-', "_");
            candidates.push(apply_format(format, &format!("{underscored}_{country}"), path));
        }
    }

    for lang in &langs {
        candidates.push(apply_format(format, lang, path));
        if lang.contains('-') {
            candidates.push(apply_format(format, &lang.replace('-', "_"), path));
        }
        if lang == DEFAULT_LANG {
            candidates.push(path.to_string());
        }
    }

    candidates
}
