use fluent_bundle::{FluentArgs, FluentBundle, FluentResource, FluentValue};
use tracing::warn;
use unic_langid::LanguageIdentifier;

/// Bundled message files; the first entry is the fallback locale.
const BUNDLED: &[(&str, &str)] = &[("en-GB", include_str!("../i18n/en-GB.ftl"))];

fn pick(requested: &str) -> (LanguageIdentifier, &'static str) {
    let fallback = BUNDLED[0];
    let wanted: Option<LanguageIdentifier> = requested.parse().ok();
    let chosen = wanted
        .as_ref()
        .and_then(|w| {
            let ids = BUNDLED.iter().filter_map(|(id, src)| Some((id.parse::<LanguageIdentifier>().ok()?, *src)));
            let mut same_language = None;
            for (id, src) in ids {
                if &id == w {
                    return Some((id, src));
                }
                if same_language.is_none() && id.language == w.language {
                    same_language = Some((id, src));
                }
            }
            same_language
        });
    chosen.unwrap_or_else(|| {
        if wanted.is_none() {
            warn!(locale = requested, "unparseable locale, using {}", fallback.0);
        }
        (fallback.0.parse().unwrap_or_default(), fallback.1)
    })
}

/// Formats operator lines from the bundled Fluent resources.
pub struct FluentLoc {
    locale: LanguageIdentifier,
    bundle: FluentBundle<FluentResource>,
}

impl FluentLoc {
    /// Localizer for `lang`, falling back to a bundled locale of the same
    /// language and then to en-GB.
    pub fn builtin(lang: &str) -> Self {
        let (locale, src) = pick(lang);
        let res = FluentResource::try_new(src.to_owned()).unwrap_or_else(|(res, errs)| {
            warn!(%locale, errors = errs.len(), "bundled messages did not parse cleanly");
            res
        });
        let mut bundle = FluentBundle::new(vec![locale.clone()]);
        // Lines are matched verbatim by operators' scripts: no bidi marks.
        bundle.set_use_isolating(false);
        if let Err(errs) = bundle.add_resource(res) {
            warn!(%locale, errors = errs.len(), "duplicate bundled message ids");
        }
        Self { locale, bundle }
    }

    pub fn locale(&self) -> &LanguageIdentifier {
        &self.locale
    }

    /// Format message `code` with string arguments. Unknown codes, or a message
    /// missing one of its arguments, come back as the bare code.
    pub fn msg(&self, code: &str, args: &[(&str, &str)]) -> String {
        let Some(pattern) = self.bundle.get_message(code).and_then(|m| m.value()) else {
            return code.to_string();
        };
        let mut fa = FluentArgs::new();
        for (name, value) in args {
            fa.set(*name, FluentValue::from(*value));
        }
        let mut errs = Vec::new();
        let line = self.bundle.format_pattern(pattern, Some(&fa), &mut errs);
        if errs.is_empty() {
            line.into_owned()
        } else {
            warn!(code, ?errs, "message could not be formatted");
            code.to_string()
        }
    }
}

impl Default for FluentLoc {
    fn default() -> Self {
        Self::builtin(BUNDLED[0].0)
    }
}
