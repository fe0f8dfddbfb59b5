//! Adapters between wiki host events and the counter service.
//!
//! These functions produce the values and message keys a host splices into
//! rendered output; they never render markup themselves.

use serde::Serialize;
use tracing::debug;

use crate::config::CountersConfig;
use crate::counters::{CounterReader, ViewRecorder};
use crate::store::{PageRecord, PageRef, TopPage};

pub const PREFERENCE_SECTION: &str = "hitcounters";
pub const PREF_EXEMPT: &str = "hitcounters-exempt";
pub const PREF_PAGE_ID: &str = "hitcounters-pageid";
pub const PREF_TEXT_LENGTH: &str = "hitcounters-textlength";
pub const PREF_MOST_VIEWED_PAGES: &str = "hitcounters-numberofmostviewedpages";

/// Who is viewing a page, as far as counting is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Viewer {
    pub is_bot: bool,
    pub is_sysop: bool,
    /// The viewer's `hitcounters-exempt` preference.
    pub exempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewedPage {
    pub page: PageRef,
    pub exists: bool,
}

pub fn should_count_view(config: &CountersConfig, viewer: &Viewer, viewed: &ViewedPage) -> bool {
    !config.disable_counters
        && !viewer.is_bot
        && !viewer.is_sysop
        && !viewer.exempt
        && viewed.exists
}

/// Page-view event handler. Returns whether the view was handed to the recorder.
pub fn on_page_view(
    recorder: &dyn ViewRecorder,
    config: &CountersConfig,
    viewer: &Viewer,
    viewed: &ViewedPage,
) -> bool {
    if !should_count_view(config, viewer, viewed) {
        return false;
    }
    recorder.record_view(&viewed.page);
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagicWord {
    /// `{{NUMBEROFVIEWS}}`: views of the whole site.
    NumberOfViews,
    /// `{{NUMBEROFPAGEVIEWS}}`: views of the page being parsed.
    NumberOfPageViews,
}

impl MagicWord {
    pub const ALL: [MagicWord; 2] = [MagicWord::NumberOfViews, MagicWord::NumberOfPageViews];

    pub fn id(self) -> &'static str {
        match self {
            Self::NumberOfViews => "numberofviews",
            Self::NumberOfPageViews => "numberofpageviews",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|word| word.id() == id)
    }
}

/// Expansion of a magic word on `page`; `None` leaves the word to the host.
pub fn magic_word_value(
    reader: &dyn CounterReader,
    config: &CountersConfig,
    word: MagicWord,
    page: &PageRef,
) -> Option<String> {
    if config.disable_counters {
        debug!(word = word.id(), "counters are disabled");
        return None;
    }
    let value = match word {
        MagicWord::NumberOfViews => reader.site_total_views(),
        MagicWord::NumberOfPageViews => reader.page_view_count(page),
    };
    Some(format_number(value.unwrap_or(0)))
}

/// Decimal digits grouped in threes with `,`.
pub fn format_number(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FooterLine {
    pub message_key: &'static str,
    pub count: u64,
    pub length: u64,
}

pub fn footer_view_count(
    reader: &dyn CounterReader,
    config: &CountersConfig,
    page: &PageRecord,
) -> Option<FooterLine> {
    if config.disable_counters || !config.counters_at_footer {
        return None;
    }
    let count = reader
        .page_view_count(&page.page_ref())
        .filter(|count| *count > 0)?;
    debug!(page_id = page.page_id, count, "footer view count");
    let message_key = if config.add_text_length {
        "hitcounters-viewcount-len"
    } else {
        "hitcounters-viewcount"
    };
    Some(FooterLine {
        message_key,
        count,
        length: page.length,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsExtras {
    pub total_views: u64,
    pub views_per_edit: String,
    pub most_viewed: Vec<TopPage>,
}

/// Extra rows for the statistics page.
///
/// `most_viewed_preference` is the viewer's `hitcounters-numberofmostviewedpages`
/// option; unset falls back to the configured default and negatives show nothing.
pub fn statistics_extras(
    reader: &dyn CounterReader,
    config: &CountersConfig,
    total_edits: u64,
    most_viewed_preference: Option<i64>,
) -> StatisticsExtras {
    let total_views = reader.site_total_views().unwrap_or(0);
    let views_per_edit = if total_edits > 0 {
        format!("{:.2}", total_views as f64 / total_edits as f64)
    } else {
        "0".to_string()
    };
    let limit = most_viewed_preference
        .unwrap_or_else(|| i64::from(config.top_pages_default_limit))
        .max(0);

    StatisticsExtras {
        total_views,
        views_per_edit,
        most_viewed: reader.top_pages(limit),
    }
}

/// Abuse-filter builder variables and the compute methods behind them.
pub const ABUSE_FILTER_BUILDER_VARS: [(&str, &str); 3] = [
    ("page_views", "page-views"),
    ("moved_from_views", "movedfrom-views"),
    ("moved_to_views", "movedto-views"),
];

pub const ABUSE_FILTER_DEPRECATED_VARS: [(&str, &str); 1] = [("article_views", "page_views")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyVariable {
    pub name: String,
    pub method: &'static str,
    pub page: PageRef,
}

pub fn title_variables(prefix: &str, page: PageRef) -> Vec<LazyVariable> {
    vec![LazyVariable {
        name: format!("{prefix}_VIEWS"),
        method: "page-views",
        page,
    }]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedVariable {
    Value(Option<u64>),
    /// The method belongs to someone else.
    NotHandled,
}

pub fn compute_variable(
    reader: &dyn CounterReader,
    method: &str,
    page: &PageRef,
) -> ComputedVariable {
    // `article-views` is kept for entries logged before the rename.
    match method {
        "page-views" | "article-views" => ComputedVariable::Value(reader.page_view_count(page)),
        _ => ComputedVariable::NotHandled,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PreferenceKind {
    Toggle,
    Int { max_length: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreferenceDefinition {
    pub key: &'static str,
    pub kind: PreferenceKind,
    pub label_message: &'static str,
    pub help_message: Option<&'static str>,
    pub section: &'static str,
}

pub fn preference_definitions() -> [PreferenceDefinition; 4] {
    let toggle = |key: &'static str, label_message: &'static str| PreferenceDefinition {
        key,
        kind: PreferenceKind::Toggle,
        label_message,
        help_message: None,
        section: PREFERENCE_SECTION,
    };
    [
        toggle(PREF_EXEMPT, "hitcounters-exempt-label"),
        toggle(PREF_PAGE_ID, "hitcounters-pageid-label"),
        toggle(PREF_TEXT_LENGTH, "hitcounters-textlength-label"),
        PreferenceDefinition {
            key: PREF_MOST_VIEWED_PAGES,
            kind: PreferenceKind::Int { max_length: 4 },
            label_message: "hitcounters-numberofmostviewedpages-label",
            help_message: Some("hitcounters-numberofmostviewedpages-help"),
            section: PREFERENCE_SECTION,
        },
    ]
}

/// One row of the popular pages listing: a title plus a message with numeric params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopularPageLine {
    pub namespace: i32,
    pub title: String,
    pub message_key: &'static str,
    pub params: Vec<u64>,
}

pub fn popular_page_line(row: &TopPage, config: &CountersConfig) -> PopularPageLine {
    let (message_key, params) = match (config.add_text_length, config.add_page_id) {
        (true, true) => (
            "hitcounters-nviews3",
            vec![row.page_id, row.count, row.length],
        ),
        (true, false) => ("hitcounters-nviews2", vec![row.count, row.length]),
        (false, _) => ("hitcounters-nviews", vec![row.count]),
    };
    PopularPageLine {
        namespace: row.namespace,
        title: row.title.clone(),
        message_key,
        params,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::counters::HitCounters;
    use crate::memory_store::MemoryCounterStore;
    use crate::store::{CounterStore, PageId};

    #[derive(Default)]
    struct FixedReader {
        counts: HashMap<PageId, u64>,
        total: Option<u64>,
        requested_limits: Mutex<Vec<i64>>,
    }

    impl CounterReader for FixedReader {
        fn page_view_count(&self, page: &PageRef) -> Option<u64> {
            self.counts.get(&page.id).copied()
        }

        fn site_total_views(&self) -> Option<u64> {
            self.total
        }

        fn top_pages(&self, limit: i64) -> Vec<TopPage> {
            self.requested_limits.lock().push(limit);
            (0..limit.clamp(0, 3))
                .map(|index| TopPage {
                    page_id: 10 + index as PageId,
                    namespace: 0,
                    title: format!("Page {index}"),
                    count: 100 - index as u64,
                    length: 50,
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct RecordingRecorder {
        seen: Mutex<Vec<PageRef>>,
    }

    impl ViewRecorder for RecordingRecorder {
        fn record_view(&self, page: &PageRef) {
            self.seen.lock().push(*page);
        }
    }

    fn record(page_id: PageId, length: u64) -> PageRecord {
        PageRecord {
            page_id,
            namespace: 0,
            title: "Milady".to_string(),
            is_redirect: false,
            length,
        }
    }

    fn existing(page_id: PageId) -> ViewedPage {
        ViewedPage {
            page: PageRef::new(page_id, 0),
            exists: true,
        }
    }

    #[test]
    fn only_ordinary_viewers_of_existing_pages_are_counted() {
        let config = CountersConfig::default();
        let recorder = RecordingRecorder::default();
        let skipped = [
            Viewer {
                is_bot: true,
                ..Viewer::default()
            },
            Viewer {
                is_sysop: true,
                ..Viewer::default()
            },
            Viewer {
                exempt: true,
                ..Viewer::default()
            },
        ];
        for viewer in skipped {
            assert!(!on_page_view(&recorder, &config, &viewer, &existing(4)));
        }
        let missing = ViewedPage {
            exists: false,
            ..existing(4)
        };
        assert!(!on_page_view(&recorder, &config, &Viewer::default(), &missing));
        assert!(recorder.seen.lock().is_empty());

        assert!(on_page_view(&recorder, &config, &Viewer::default(), &existing(4)));
        assert_eq!(*recorder.seen.lock(), vec![PageRef::new(4, 0)]);
    }

    #[test]
    fn disabled_counters_skip_page_views() {
        let config = CountersConfig {
            disable_counters: true,
            ..CountersConfig::default()
        };
        assert!(!should_count_view(&config, &Viewer::default(), &existing(4)));
    }

    #[test]
    fn page_view_reaches_the_store_through_the_service() {
        let store = Arc::new(MemoryCounterStore::new());
        let config = CountersConfig::default();
        let counters = HitCounters::new(store.clone(), Arc::new(MemoryCache::new()), config.clone())
            .expect("counters");
        on_page_view(&counters, &config, &Viewer::default(), &existing(12));
        on_page_view(&counters, &config, &Viewer::default(), &existing(12));
        counters.flush();
        assert_eq!(store.get_count(12).expect("get"), Some(2));
    }

    #[test]
    fn magic_words_resolve_by_id() {
        assert_eq!(
            MagicWord::from_id("numberofviews"),
            Some(MagicWord::NumberOfViews)
        );
        assert_eq!(
            MagicWord::from_id("numberofpageviews"),
            Some(MagicWord::NumberOfPageViews)
        );
        assert_eq!(MagicWord::from_id("numberofedits"), None);
    }

    #[test]
    fn magic_word_values_are_grouped() {
        let reader = FixedReader {
            counts: HashMap::from([(3, 1_234)]),
            total: Some(9_876_543),
            ..FixedReader::default()
        };
        let config = CountersConfig::default();
        let page = PageRef::new(3, 0);
        assert_eq!(
            magic_word_value(&reader, &config, MagicWord::NumberOfViews, &page).as_deref(),
            Some("9,876,543")
        );
        assert_eq!(
            magic_word_value(&reader, &config, MagicWord::NumberOfPageViews, &page).as_deref(),
            Some("1,234")
        );
        assert_eq!(
            magic_word_value(
                &reader,
                &config,
                MagicWord::NumberOfPageViews,
                &PageRef::new(4, 0)
            )
            .as_deref(),
            Some("0")
        );
    }

    #[test]
    fn magic_words_are_left_alone_when_disabled() {
        let reader = FixedReader {
            total: Some(5),
            ..FixedReader::default()
        };
        let config = CountersConfig {
            disable_counters: true,
            ..CountersConfig::default()
        };
        assert_eq!(
            magic_word_value(&reader, &config, MagicWord::NumberOfViews, &PageRef::new(1, 0)),
            None
        );
    }

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(123_456_789), "123,456,789");
    }

    #[test]
    fn footer_needs_a_nonzero_count() {
        let reader = FixedReader {
            counts: HashMap::from([(1, 0), (2, 77)]),
            ..FixedReader::default()
        };
        let config = CountersConfig::default();
        assert_eq!(footer_view_count(&reader, &config, &record(1, 10)), None);
        assert_eq!(footer_view_count(&reader, &config, &record(3, 10)), None);
        assert_eq!(
            footer_view_count(&reader, &config, &record(2, 10)),
            Some(FooterLine {
                message_key: "hitcounters-viewcount",
                count: 77,
                length: 10,
            })
        );
    }

    #[test]
    fn footer_follows_configuration() {
        let reader = FixedReader {
            counts: HashMap::from([(2, 77)]),
            ..FixedReader::default()
        };
        let with_length = CountersConfig {
            add_text_length: true,
            ..CountersConfig::default()
        };
        let line = footer_view_count(&reader, &with_length, &record(2, 10)).expect("footer");
        assert_eq!(line.message_key, "hitcounters-viewcount-len");

        let no_footer = CountersConfig {
            counters_at_footer: false,
            ..CountersConfig::default()
        };
        assert_eq!(footer_view_count(&reader, &no_footer, &record(2, 10)), None);

        let disabled = CountersConfig {
            disable_counters: true,
            ..CountersConfig::default()
        };
        assert_eq!(footer_view_count(&reader, &disabled, &record(2, 10)), None);
    }

    #[test]
    fn statistics_report_views_per_edit() {
        let reader = FixedReader {
            total: Some(1_000),
            ..FixedReader::default()
        };
        let config = CountersConfig::default();
        let extras = statistics_extras(&reader, &config, 300, Some(2));
        assert_eq!(extras.total_views, 1_000);
        assert_eq!(extras.views_per_edit, "3.33");
        assert_eq!(extras.most_viewed.len(), 2);

        let no_edits = statistics_extras(&reader, &config, 0, Some(2));
        assert_eq!(no_edits.views_per_edit, "0");
    }

    #[test]
    fn statistics_limit_comes_from_preference_or_default() {
        let reader = FixedReader::default();
        let config = CountersConfig {
            top_pages_default_limit: 25,
            ..CountersConfig::default()
        };
        let unknown = statistics_extras(&reader, &config, 10, Some(-4));
        assert_eq!(unknown.total_views, 0);
        assert_eq!(unknown.views_per_edit, "0.00");
        assert!(unknown.most_viewed.is_empty());
        statistics_extras(&reader, &config, 10, None);
        assert_eq!(*reader.requested_limits.lock(), vec![0, 25]);
    }

    #[test]
    fn abuse_filter_variables() {
        let reader = FixedReader {
            counts: HashMap::from([(8, 41)]),
            ..FixedReader::default()
        };
        let page = PageRef::new(8, 0);
        assert_eq!(
            compute_variable(&reader, "page-views", &page),
            ComputedVariable::Value(Some(41))
        );
        assert_eq!(
            compute_variable(&reader, "article-views", &page),
            ComputedVariable::Value(Some(41))
        );
        assert_eq!(
            compute_variable(&reader, "page-views", &PageRef::new(9, 0)),
            ComputedVariable::Value(None)
        );
        assert_eq!(
            compute_variable(&reader, "page-age", &page),
            ComputedVariable::NotHandled
        );

        let vars = title_variables("moved_to", page);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "moved_to_VIEWS");
        assert_eq!(vars[0].method, "page-views");
        assert!(ABUSE_FILTER_DEPRECATED_VARS.contains(&("article_views", "page_views")));
    }

    #[test]
    fn preferences_live_in_one_section() {
        let definitions = preference_definitions();
        assert!(definitions
            .iter()
            .all(|definition| definition.section == PREFERENCE_SECTION));
        let most_viewed = definitions
            .iter()
            .find(|definition| definition.key == PREF_MOST_VIEWED_PAGES)
            .expect("most viewed preference");
        assert_eq!(most_viewed.kind, PreferenceKind::Int { max_length: 4 });
        assert!(most_viewed.help_message.is_some());
    }

    #[test]
    fn popular_page_line_picks_message_by_config() {
        let row = TopPage {
            page_id: 7,
            namespace: 0,
            title: "Main Page".to_string(),
            count: 900,
            length: 2_048,
        };
        let plain = popular_page_line(&row, &CountersConfig::default());
        assert_eq!(plain.message_key, "hitcounters-nviews");
        assert_eq!(plain.params, vec![900]);

        let with_length = CountersConfig {
            add_text_length: true,
            ..CountersConfig::default()
        };
        let line = popular_page_line(&row, &with_length);
        assert_eq!(line.message_key, "hitcounters-nviews2");
        assert_eq!(line.params, vec![900, 2_048]);

        let with_id = CountersConfig {
            add_text_length: true,
            add_page_id: true,
            ..CountersConfig::default()
        };
        let line = popular_page_line(&row, &with_id);
        assert_eq!(line.message_key, "hitcounters-nviews3");
        assert_eq!(line.params, vec![7, 900, 2_048]);

        // The page id is only shown alongside the length.
        let id_only = CountersConfig {
            add_page_id: true,
            ..CountersConfig::default()
        };
        assert_eq!(popular_page_line(&row, &id_only).message_key, "hitcounters-nviews");
    }
}
