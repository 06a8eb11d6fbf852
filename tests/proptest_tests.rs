#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use proptest::prelude::*;

use airbnb_madrid::adapters::memory::MemoryStore;
use airbnb_madrid::domain::filter::Filter;
use airbnb_madrid::domain::listing::RoomType;
use airbnb_madrid::domain::pipeline::Pipeline;
use airbnb_madrid::domain::query::FindQuery;
use airbnb_madrid::domain::schema::validate_document;
use airbnb_madrid::domain::value::{as_integer, compare};
use airbnb_madrid::import::{RowCleaner, sample_indices};
use airbnb_madrid::repository::ListingRepository;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

const HOODS: [&str; 4] = ["Centro", "Retiro", "Salamanca", "Chamberí"];

fn arb_listing() -> impl Strategy<Value = Document> {
    (
        "[A-Za-z ]{1,20}",
        0.0..2000.0_f64,
        prop::sample::select(HOODS.to_vec()),
        prop::sample::select(RoomType::ALL.to_vec()),
        0..=365_i32,
    )
        .prop_map(|(name, price, hood, room, availability)| {
            doc! {
                "name": name,
                "price": price,
                "neighbourhood": hood,
                "room_type": room.as_str(),
                "availability_365": availability,
            }
        })
}

fn arb_filter() -> impl Strategy<Value = Filter> {
    let leaf = prop_oneof![
        prop::sample::select(HOODS.to_vec()).prop_map(|h| Filter::eq("neighbourhood", h)),
        (0.0..2000.0_f64).prop_map(|p| Filter::lt("price", p)),
        (0.0..2000.0_f64).prop_map(|p| Filter::gte("price", p)),
        prop::sample::select(RoomType::ALL.to_vec()).prop_map(|r| Filter::ne("room_type", r)),
        Just(Filter::eq("availability_365", 0)),
    ];
    leaf.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a.and(b)),
            prop::collection::vec(inner, 1..3).prop_map(Filter::or),
        ]
    })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

async fn seeded(docs: Vec<Document>) -> ListingRepository {
    let repo = ListingRepository::new(std::sync::Arc::new(MemoryStore::with_validator(
        "airbnb_madrid",
        "listings",
    )));
    repo.create_many(docs).await.unwrap();
    repo
}

// ---------------------------------------------------------------------------
// Query properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn count_matches_find_length(
        docs in prop::collection::vec(arb_listing(), 0..30),
        filter in arb_filter(),
    ) {
        let (counted, found) = runtime().block_on(async {
            let repo = seeded(docs).await;
            let counted = repo.count(&filter).await.unwrap();
            let found: Vec<Document> = repo
                .find(&FindQuery::new(filter.clone()))
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            (counted, found.len())
        });
        prop_assert_eq!(counted as usize, found);
    }

    #[test]
    fn filter_survives_a_document_round_trip(filter in arb_filter()) {
        let reparsed = Filter::from_document(&filter.to_document()).unwrap();
        prop_assert_eq!(reparsed.to_document(), filter.to_document());
    }

    #[test]
    fn price_range_results_are_sorted_and_bounded(
        docs in prop::collection::vec(arb_listing(), 0..30),
        a in 0.0..2000.0_f64,
        b in 0.0..2000.0_f64,
    ) {
        let (min, max) = if a <= b { (a, b) } else { (b, a) };
        let hits = runtime().block_on(async {
            seeded(docs).await.find_by_price_range(min, max, 0).await.unwrap()
        });
        let prices: Vec<f64> = hits.iter().map(|d| d.get_f64("price").unwrap()).collect();
        prop_assert!(prices.iter().all(|p| (min..=max).contains(p)));
        prop_assert!(prices.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn delete_removes_exactly_the_matches(
        docs in prop::collection::vec(arb_listing(), 0..30),
        filter in arb_filter(),
    ) {
        let (total, matched, deleted, left) = runtime().block_on(async {
            let repo = seeded(docs).await;
            let total = repo.total_listings().await.unwrap();
            let matched = repo.count(&filter).await.unwrap();
            let deleted = repo.delete(&filter).await.unwrap();
            let left = repo.total_listings().await.unwrap();
            (total, matched, deleted, left)
        });
        prop_assert_eq!(matched, deleted);
        prop_assert_eq!(left, total - deleted);
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn generated_listings_are_valid(doc in arb_listing()) {
        prop_assert!(validate_document(&doc).is_ok());
    }

    #[test]
    fn negative_prices_are_rejected(price in -1.0e9..-1.0e-9_f64) {
        let doc = doc! { "name": "x", "price": price };
        prop_assert!(validate_document(&doc).is_err());
    }

    #[test]
    fn availability_outside_a_year_is_rejected(days in prop_oneof![i32::MIN..0, 366..i32::MAX]) {
        let doc = doc! { "name": "x", "price": 1, "availability_365": days };
        prop_assert!(validate_document(&doc).is_err());
    }

    #[test]
    fn unknown_room_types_are_rejected(label in "[a-z ]{0,16}") {
        prop_assume!(RoomType::parse(&label).is_none());
        let doc = doc! { "name": "x", "price": 1, "room_type": label };
        prop_assert!(validate_document(&doc).is_err());
    }
}

// ---------------------------------------------------------------------------
// Parsers never panic
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn filter_from_json_never_panics(text in "\\PC{0,64}") {
        let _ = Filter::from_json(&text);
    }

    #[test]
    fn pipeline_from_json_never_panics(text in "\\PC{0,64}") {
        let _ = Pipeline::from_json(&text);
    }

    #[test]
    fn skip_and_limit_render_back(limit in 1_u64..1000, skip in 0_u64..1000) {
        let json = format!(r#"[{{"$skip": {skip}}}, {{"$limit": {limit}}}]"#);
        let rendered = Pipeline::from_json(&json).unwrap().to_documents();
        prop_assert_eq!(rendered.len(), 2);
        prop_assert_eq!(rendered[0].get("$skip").and_then(as_integer), Some(skip as i64));
        prop_assert_eq!(rendered[1].get("$limit").and_then(as_integer), Some(limit as i64));
    }

    #[test]
    fn row_cleaner_never_panics(cells in prop::collection::vec("\\PC{0,12}", 5)) {
        let headers = csv::StringRecord::from(vec!["name", "price", "latitude", "longitude", "last_review"]);
        let row = csv::StringRecord::from(cells);
        if let Some(doc) = RowCleaner::new(false).clean(&headers, &row) {
            prop_assert!(doc.get("price").is_some_and(|p| matches!(p, Bson::Double(_))));
        }
    }
}

// ---------------------------------------------------------------------------
// Sampling and ordering
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn sample_indices_are_sorted_unique_and_in_range(len in 0_usize..500, amount in 0_usize..600) {
        let picked = sample_indices(len, amount);
        let expected = if amount == 0 { len } else { amount.min(len) };
        prop_assert_eq!(picked.len(), expected);
        prop_assert!(picked.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(picked.iter().all(|&i| i < len));
    }

    #[test]
    fn compare_orders_numbers_across_types(a in any::<i32>(), b in -1.0e10..1.0e10_f64) {
        let ord = compare(&Bson::Int32(a), &Bson::Double(b));
        prop_assert_eq!(Some(ord), f64::from(a).partial_cmp(&b));
    }
}
