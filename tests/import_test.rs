#![allow(clippy::too_many_lines)]

use std::io::Write;
use std::sync::Arc;

use mongodb::bson::{Bson, doc};
use pretty_assertions::assert_eq;

use airbnb_madrid::adapters::memory::MemoryStore;
use airbnb_madrid::bootstrap::{BootstrapOptions, bootstrap, create_indexes};
use airbnb_madrid::config::types::InvalidRowPolicy;
use airbnb_madrid::domain::filter::Filter;
use airbnb_madrid::domain::geo::GeoPoint;
use airbnb_madrid::domain::listing::RoomType;
use airbnb_madrid::error::ListingsError;
use airbnb_madrid::import::{IMPORTED_AT, ImportOptions, ImportReport, Importer};
use airbnb_madrid::repository::ListingRepository;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const LISTINGS_CSV: &str = "\
id,name,description,host_name,host_is_superhost,neighbourhood,latitude,longitude,room_type,price,minimum_nights,number_of_reviews,last_review,reviews_per_month,review_scores_rating,availability_365,calendar_updated
6369,Ático con terraza,Vistas al Palacio Real,Simon,t,Centro,40.4170,-3.7070,Entire home/apt,\"$1,020.00\",3,80,2024-05-01,0.6,4.9,120,
21853,Habitación luminosa,Cerca del Retiro,María,f,Retiro,40.4120,-3.6840,Private room,$35.00,2,33,2023-11-12,,4.5,0,
23001,,Junto al metro,,f,Arganzuela,40.3970,-3.6940,Shared room,$18.00,1,0,,,,365,
24805,Suite Gran Vía,Hotel boutique en Gran Vía,Hotel,t,Centro,40.4200,-3.7050,Hotel room,$150.00,1,210,2024-06-20,2.1,4.7,300,
26825,Sin coordenadas,,Ana,f,Centro,,,Private room,$40.00,1,0,,,,50,
";

async fn madrid() -> (Arc<MemoryStore>, ListingRepository) {
    let store = Arc::new(MemoryStore::default());
    bootstrap(store.as_ref(), &BootstrapOptions::default())
        .await
        .unwrap();
    (store.clone(), ListingRepository::new(store))
}

fn csv_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    file.write_all(LISTINGS_CSV.as_bytes()).unwrap();
    file
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn csv_import_end_to_end() {
    let (store, repo) = madrid().await;
    let file = csv_file();

    let report = Importer::new(repo.clone(), ImportOptions::default())
        .import_csv(file.path())
        .await
        .unwrap();
    assert_eq!(
        report,
        ImportReport {
            rows_read: 5,
            rows_dropped: 1,
            inserted: 4,
            rejected: 0,
            cleared: 0,
        }
    );
    let indexes = create_indexes(store.as_ref()).await.unwrap();
    assert!(indexes.created.is_empty());

    assert_eq!(repo.total_listings().await.unwrap(), 4);

    let atico = repo.search_by_name("ático", 1).await.unwrap();
    let atico = &atico[0];
    assert_eq!(atico.get_f64("price").unwrap(), 1020.0);
    assert!(atico.get_bool("host_is_superhost").unwrap());
    assert!(atico.get_datetime("last_review").is_ok());
    assert!(atico.get_datetime(IMPORTED_AT).is_ok());
    assert!((atico.get_f64("review_scores_rating").unwrap() - 4.9).abs() < 1e-9);
    assert_eq!(atico.get("calendar_updated"), Some(&Bson::Null));

    let unnamed = repo
        .find_by_neighbourhood("Arganzuela", 0)
        .await
        .unwrap();
    assert_eq!(unnamed[0].get_str("name").unwrap(), "Sin nombre");
    assert_eq!(unnamed[0].get_str("host_name").unwrap(), "Sin nombre");
    assert_eq!(unnamed[0].get_f64("reviews_per_month").unwrap(), 0.0);
}

#[tokio::test]
async fn imported_listings_answer_the_usual_questions() {
    let (_, repo) = madrid().await;
    let file = csv_file();
    Importer::new(repo.clone(), ImportOptions::default())
        .import_csv(file.path())
        .await
        .unwrap();

    let stats = repo.price_stats_by_neighbourhood().await.unwrap();
    assert_eq!(stats[0].neighbourhood.as_deref(), Some("Centro"));
    assert_eq!(stats[0].count, 2);
    assert_eq!(stats[0].max_price, 1020.0);

    let rooms = repo.count_by_room_type().await.unwrap();
    assert_eq!(rooms.len(), 4);
    assert!(rooms.iter().all(|r| r.count == 1));

    let cheap = repo.find_by_price_range(0.0, 50.0, 0).await.unwrap();
    let prices: Vec<f64> = cheap.iter().map(|d| d.get_f64("price").unwrap()).collect();
    assert_eq!(prices, vec![18.0, 35.0]);

    let hotels = repo.find_by_room_type(RoomType::HotelRoom, 0).await.unwrap();
    assert_eq!(hotels[0].get_str("name").unwrap(), "Suite Gran Vía");

    let near_sol = repo
        .find_near(GeoPoint::new(-3.7038, 40.4168), Some(500.0), 0)
        .await
        .unwrap();
    assert_eq!(near_sol.len(), 2);

    let palacio = repo.search_text("palacio", 5).await.unwrap();
    assert_eq!(palacio.len(), 1);

    assert_eq!(repo.delete_unavailable().await.unwrap(), 1);
}

#[tokio::test]
async fn numeric_looking_names_and_neighbourhoods_are_imported() {
    let (_, repo) = madrid().await;
    let csv = "\
name,host_name,neighbourhood,latitude,longitude,room_type,price
1984,Orwell,Centro,40.4168,-3.7038,Private room,$40.00
Piso junto al Rastro,Lucía,28012,40.4090,-3.7070,Entire home/apt,$75.00
Estudio Malasaña,2001,Universidad,40.4260,-3.7040,Entire home/apt,$60.00
";
    let report = Importer::new(repo.clone(), ImportOptions::default())
        .import_csv_reader(csv.as_bytes())
        .await
        .unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(report.rejected, 0);

    let by_name = repo.search_by_name("1984", 1).await.unwrap();
    assert_eq!(by_name[0].get_str("name").unwrap(), "1984");
    assert_eq!(repo.find_by_neighbourhood("28012", 0).await.unwrap().len(), 1);
    assert_eq!(
        repo.count(&Filter::eq("host_name", "2001")).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn sampled_import_is_repeatable() {
    let options = ImportOptions {
        sample_size: 3,
        ..ImportOptions::default()
    };
    let mut picked = Vec::new();
    for _ in 0..2 {
        let (_, repo) = madrid().await;
        Importer::new(repo.clone(), options.clone())
            .import_csv_reader(LISTINGS_CSV.as_bytes())
            .await
            .unwrap();
        picked.push(repo.distinct_values("name").await.unwrap());
    }
    assert_eq!(picked[0], picked[1]);
}

#[tokio::test]
async fn reimport_replaces_previous_listings() {
    let (_, repo) = madrid().await;
    let importer = Importer::new(repo.clone(), ImportOptions::default());
    importer.import_csv_reader(LISTINGS_CSV.as_bytes()).await.unwrap();
    let report = importer.import_csv_reader(LISTINGS_CSV.as_bytes()).await.unwrap();
    assert_eq!(report.cleared, 4);
    assert_eq!(repo.total_listings().await.unwrap(), 4);
}

#[tokio::test]
async fn abort_policy_stops_on_bad_rows() {
    let (_, repo) = madrid().await;
    let csv = "name,price,room_type\nok,$10.00,Private room\nbad,$10.00,Castle\n";
    let importer = Importer::new(
        repo.clone(),
        ImportOptions {
            on_invalid: InvalidRowPolicy::Abort,
            ..ImportOptions::default()
        },
    );
    let err = importer.import_csv_reader(csv.as_bytes()).await.unwrap_err();
    assert!(matches!(err, ListingsError::Validation { .. }));
    assert_eq!(repo.total_listings().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_csv_is_an_io_error() {
    let (_, repo) = madrid().await;
    let dir = tempfile::tempdir().unwrap();
    let err = Importer::new(repo, ImportOptions::default())
        .import_csv(&dir.path().join("listings.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, ListingsError::Io(_)));
}

// ---------------------------------------------------------------------------
// JSON import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn json_import_accepts_extended_json() {
    let (_, repo) = madrid().await;
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"[
            {{"name": "Loft", "price": 60, "neighbourhood": "Chamberí",
              "room_type": "Entire home/apt", "last_review": {{"$date": "2024-01-15T00:00:00Z"}}}},
            {{"name": "Cuarto", "price": 25.5, "room_type": "Private room"}}
        ]"#
    )
    .unwrap();

    let report = Importer::new(repo.clone(), ImportOptions::default())
        .import_json(file.path())
        .await
        .unwrap();
    assert_eq!(report.inserted, 2);

    let loft = repo
        .find_by_neighbourhood("Chamberí", 1)
        .await
        .unwrap()
        .remove(0);
    assert!(loft.get_datetime("last_review").is_ok());
    assert_eq!(
        repo.count(&Filter::eq("room_type", "Private room")).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn json_import_keeps_existing_data_without_clear() {
    let (_, repo) = madrid().await;
    repo.create(doc! { "name": "Existing", "price": 10 }).await.unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"[{"name": "New", "price": 20}]"#).unwrap();

    let options = ImportOptions {
        clear_existing: false,
        ..ImportOptions::default()
    };
    let err = Importer::new(repo.clone(), options)
        .import_json(file.path())
        .await
        .unwrap_err();
    assert!(matches!(err, ListingsError::Config(_)));
    assert_eq!(repo.total_listings().await.unwrap(), 1);
}
