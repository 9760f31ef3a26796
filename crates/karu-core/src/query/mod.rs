//! Query service
//!
//! The search-expression parser and its evaluation over the tag/image
//! relation, with pagination and the homepage hot buffer.
//!
//! Grammar: space-separated tokens. Bare tokens are required tags, `-tag`
//! excludes, `source:` / `has:parent` / `has:child` / `pool:` / `category:` /
//! `order:` are typed filters, and a token shaped like a filename (image
//! extension, `NNN_pNN`, or a 32-hex MD5) switches to filename match.

use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::cache::{CacheManager, HomepageEntry};
use crate::catalog::{Catalog, Result, TagCategory};
use crate::config::Config;
use crate::pools::PoolRepository;
use crate::tags::normalize_tag_name;

// ============================================================================
// EXPRESSION
// ============================================================================

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Insertion order (default)
    #[default]
    Insertion,
    Newest,
    Oldest,
}

/// A parsed search expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchExpr {
    pub required_tags: Vec<String>,
    pub excluded_tags: Vec<String>,
    pub sources: Vec<String>,
    pub has_parent: bool,
    pub has_child: bool,
    pub pools: Vec<String>,
    pub categories: Vec<String>,
    pub filename: Option<String>,
    pub order: SortOrder,
}

/// Whether a bare token is really a filename fragment.
pub fn looks_like_filename(token: &str) -> bool {
    let lower = token.to_lowercase();
    if crate::config::IMAGE_EXTENSIONS
        .iter()
        .chain(crate::config::VIDEO_EXTENSIONS)
        .chain(crate::config::ZIP_EXTENSIONS)
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
    {
        return true;
    }
    static PATTERNS: std::sync::OnceLock<(Regex, Regex)> = std::sync::OnceLock::new();
    let (pixiv, md5) = PATTERNS.get_or_init(|| {
        (
            Regex::new(r"^\d+_p\d+").expect("static pattern"),
            Regex::new(r"^[a-f0-9]{32}$").expect("static pattern"),
        )
    });
    pixiv.is_match(&lower) || md5.is_match(&lower)
}

/// Parse a query string into an expression.
pub fn parse_query(query: &str) -> SearchExpr {
    let mut expr = SearchExpr::default();

    for token in query.split_whitespace() {
        if let Some(rest) = token.strip_prefix("source:") {
            if !rest.is_empty() {
                expr.sources.push(rest.to_lowercase());
            }
        } else if let Some(rest) = token.strip_prefix("has:") {
            match rest {
                "parent" => expr.has_parent = true,
                "child" => expr.has_child = true,
                _ => {}
            }
        } else if let Some(rest) = token.strip_prefix("pool:") {
            if !rest.is_empty() {
                expr.pools.push(rest.to_string());
            }
        } else if let Some(rest) = token.strip_prefix("category:") {
            if !rest.is_empty() {
                expr.categories.push(rest.to_lowercase());
            }
        } else if let Some(rest) = token.strip_prefix("order:") {
            expr.order = match rest {
                "new" | "newest" => SortOrder::Newest,
                "old" | "oldest" => SortOrder::Oldest,
                _ => expr.order,
            };
        } else if let Some(rest) = token.strip_prefix('-') {
            if !rest.is_empty() {
                expr.excluded_tags.push(normalize_tag_name(rest));
            }
        } else if looks_like_filename(token) {
            expr.filename = Some(token.to_lowercase());
        } else {
            expr.required_tags.push(normalize_tag_name(token));
        }
    }

    expr
}

// ============================================================================
// RESULTS
// ============================================================================

/// One search result row.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub filepath: String,
    pub tags: String,
}

/// A paginated result page.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub images: Vec<SearchResult>,
    pub page: usize,
    pub total_pages: usize,
    pub total_results: usize,
    pub has_more: bool,
}

// ============================================================================
// SERVICE
// ============================================================================

/// The query service.
pub struct QueryService {
    catalog: Arc<Catalog>,
    pools: PoolRepository,
    config: Config,
}

impl QueryService {
    pub fn new(catalog: Arc<Catalog>, config: Config) -> Self {
        Self {
            pools: PoolRepository::new(catalog.clone()),
            catalog,
            config,
        }
    }

    /// Parse, evaluate, and paginate a query string.
    pub fn search(&self, query: &str, page: usize, per_page: Option<usize>) -> Result<SearchPage> {
        let expr = parse_query(query);
        self.search_expr(&expr, page, per_page)
    }

    /// Evaluate a parsed expression with pagination.
    pub fn search_expr(
        &self,
        expr: &SearchExpr,
        page: usize,
        per_page: Option<usize>,
    ) -> Result<SearchPage> {
        let ids = self.evaluate(expr)?;
        let per_page = self.config.page_size(per_page);
        let total_results = ids.len();
        let total_pages = total_results.div_ceil(per_page).max(1);
        let page = page.max(1);

        let page_ids: Vec<i64> = ids
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        let mut images = Vec::with_capacity(page_ids.len());
        for id in page_ids {
            if let Some(img) = self.catalog.image_by_id(id)? {
                images.push(SearchResult {
                    id,
                    tags: img.all_tags().join(" "),
                    filepath: img.filepath,
                });
            }
        }

        Ok(SearchPage {
            images,
            page,
            total_pages,
            total_results,
            has_more: page < total_pages,
        })
    }

    /// Evaluate an expression into an ordered id list.
    pub fn evaluate(&self, expr: &SearchExpr) -> Result<Vec<i64>> {
        let mut sql = String::from("SELECT i.id FROM images i WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        for tag in &expr.required_tags {
            sql.push_str(
                " AND i.id IN (SELECT it.image_id FROM image_tags it
                               JOIN tags t ON t.id = it.tag_id WHERE t.name = ?)",
            );
            params.push(Box::new(tag.clone()));
        }
        for tag in &expr.excluded_tags {
            sql.push_str(
                " AND i.id NOT IN (SELECT it.image_id FROM image_tags it
                                   JOIN tags t ON t.id = it.tag_id WHERE t.name = ?)",
            );
            params.push(Box::new(tag.clone()));
        }
        for source in &expr.sources {
            sql.push_str(
                " AND i.id IN (SELECT ims.image_id FROM image_sources ims
                               JOIN sources s ON s.id = ims.source_id WHERE s.name = ?)",
            );
            params.push(Box::new(source.clone()));
        }
        if expr.has_parent {
            sql.push_str(" AND i.parent_id IS NOT NULL");
        }
        if expr.has_child {
            sql.push_str(" AND i.has_children = 1");
        }
        for category in &expr.categories {
            match category.as_str() {
                "character" | "copyright" | "artist" | "species" | "meta" | "general" => {
                    let column = TagCategory::parse_name(category)
                        .column()
                        .expect("validated category");
                    sql.push_str(&format!(" AND i.{} != ''", column));
                }
                _ => {}
            }
        }
        if let Some(fragment) = &expr.filename {
            sql.push_str(" AND (LOWER(i.filepath) LIKE ? OR i.md5 = ?)");
            params.push(Box::new(format!("%{}%", fragment)));
            params.push(Box::new(fragment.clone()));
        }
        for pool in &expr.pools {
            let pool_ids = self.pools.image_ids_by_pool_name(pool)?;
            if pool_ids.is_empty() {
                return Ok(vec![]);
            }
            let placeholders = pool_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND i.id IN ({})", placeholders));
            for id in pool_ids {
                params.push(Box::new(id));
            }
        }

        sql.push_str(match expr.order {
            SortOrder::Insertion => " ORDER BY i.id",
            SortOrder::Newest => " ORDER BY i.ingested_at DESC, i.id DESC",
            SortOrder::Oldest => " ORDER BY i.ingested_at ASC, i.id ASC",
        });

        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let bound = rusqlite::params_from_iter(params.iter().map(|p| p.as_ref()));
        let ids = stmt
            .query_map(bound, |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // ========================================================================
    // HOMEPAGE
    // ========================================================================

    /// Pop a pre-assembled homepage page, building one synchronously on a
    /// cold buffer.
    pub fn homepage(&self, cache: &CacheManager) -> Result<(Vec<HomepageEntry>, i64)> {
        let total = self.catalog.image_count()?;
        if let Some(page) = cache.pop_homepage_page() {
            return Ok((page, total));
        }
        cache.refill_homepage(&self.catalog)?;
        Ok((cache.pop_homepage_page().unwrap_or_default(), total))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;
    use crate::catalog::CategorizedTags;

    fn setup() -> (Arc<Catalog>, QueryService) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());

        let mut first = sample_commit("alpha/one.jpg", "a1b2c3d4a1b2c3d4a1b2c3d4a1b2c3d4");
        first.tags = CategorizedTags {
            character: vec!["aoi_(sample)".into()],
            copyright: vec!["sample".into()],
            general: vec!["1girl".into(), "smile".into()],
            ..Default::default()
        };
        catalog.commit_ingest(&first).unwrap();

        let mut second = sample_commit("beta/123456_p0.png", "ffffffffffffffffffffffffffffffff");
        second.tags = CategorizedTags {
            general: vec!["1girl".into(), "landscape".into()],
            ..Default::default()
        };
        second.source_names = vec!["pixiv".into()];
        second.active_source = Some("pixiv".into());
        second.parent_id = Some(42);
        catalog.commit_ingest(&second).unwrap();

        let service = QueryService::new(catalog.clone(), Config::default());
        (catalog, service)
    }

    #[test]
    fn parser_splits_token_kinds() {
        let expr = parse_query("1girl -landscape source:danbooru has:parent pool:story order:newest category:character");
        assert_eq!(expr.required_tags, vec!["1girl"]);
        assert_eq!(expr.excluded_tags, vec!["landscape"]);
        assert_eq!(expr.sources, vec!["danbooru"]);
        assert!(expr.has_parent);
        assert!(!expr.has_child);
        assert_eq!(expr.pools, vec!["story"]);
        assert_eq!(expr.categories, vec!["character"]);
        assert_eq!(expr.order, SortOrder::Newest);
    }

    #[test]
    fn filename_shaped_tokens_switch_to_filename_match() {
        assert!(looks_like_filename("something.png"));
        assert!(looks_like_filename("123456_p0"));
        assert!(looks_like_filename("a1b2c3d4a1b2c3d4a1b2c3d4a1b2c3d4"));
        assert!(!looks_like_filename("blue_hair"));

        let expr = parse_query("123456_p0.png");
        assert!(expr.required_tags.is_empty());
        assert_eq!(expr.filename.as_deref(), Some("123456_p0.png"));
    }

    #[test]
    fn required_and_excluded_tags_intersect() {
        let (_c, service) = setup();
        let page = service.search("1girl", 1, None).unwrap();
        assert_eq!(page.total_results, 2);

        let page = service.search("1girl -landscape", 1, None).unwrap();
        assert_eq!(page.total_results, 1);
        assert_eq!(page.images[0].filepath, "alpha/one.jpg");

        let page = service.search("1girl smile", 1, None).unwrap();
        assert_eq!(page.total_results, 1);
    }

    #[test]
    fn typed_filters() {
        let (_c, service) = setup();
        let page = service.search("source:pixiv", 1, None).unwrap();
        assert_eq!(page.total_results, 1);
        assert_eq!(page.images[0].filepath, "beta/123456_p0.png");

        let page = service.search("has:parent", 1, None).unwrap();
        assert_eq!(page.total_results, 1);

        let page = service.search("category:character", 1, None).unwrap();
        assert_eq!(page.total_results, 1);
        assert_eq!(page.images[0].filepath, "alpha/one.jpg");
    }

    #[test]
    fn filename_and_md5_match() {
        let (_c, service) = setup();
        let page = service.search("123456_p0.png", 1, None).unwrap();
        assert_eq!(page.total_results, 1);

        let page = service
            .search("a1b2c3d4a1b2c3d4a1b2c3d4a1b2c3d4", 1, None)
            .unwrap();
        assert_eq!(page.total_results, 1);
        assert_eq!(page.images[0].filepath, "alpha/one.jpg");
    }

    #[test]
    fn order_overrides_default() {
        let (_c, service) = setup();
        let newest = service.search("1girl order:newest", 1, None).unwrap();
        let oldest = service.search("1girl order:oldest", 1, None).unwrap();
        assert_eq!(
            newest.images.first().map(|i| i.id),
            oldest.images.last().map(|i| i.id)
        );
    }

    #[test]
    fn pagination_caps_and_pages() {
        let (catalog, service) = setup();
        for i in 0..5 {
            let mut commit = sample_commit(&format!("bulk/{}.jpg", i), &format!("bulkmd5{}", i));
            commit.tags = CategorizedTags {
                general: vec!["bulk_tag".into()],
                ..Default::default()
            };
            catalog.commit_ingest(&commit).unwrap();
        }
        let page = service.search("bulk_tag", 1, Some(2)).unwrap();
        assert_eq!(page.total_results, 5);
        assert_eq!(page.images.len(), 2);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_more);

        let last = service.search("bulk_tag", 3, Some(2)).unwrap();
        assert_eq!(last.images.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn pool_filter_returns_pool_members_only() {
        let (catalog, service) = setup();
        let pools = PoolRepository::new(catalog.clone());
        let pool = pools.create_pool("story", "").unwrap();
        let first = catalog.image_by_filepath("alpha/one.jpg").unwrap().unwrap().id;
        pools.add_image(pool, first).unwrap();

        let page = service.search("pool:story", 1, None).unwrap();
        assert_eq!(page.total_results, 1);
        assert_eq!(page.images[0].id, first);

        let none = service.search("pool:unknown", 1, None).unwrap();
        assert_eq!(none.total_results, 0);
    }
}
