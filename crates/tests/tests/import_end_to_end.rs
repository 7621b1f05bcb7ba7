use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use haven_core::{RegionPath, RegionType};
use haven_import::{
    FailureReason, FixedGeocoder, GeocodeOutcome, Geocoder, GoogleGeocoder, ImportPipeline,
};
use haven_storage::{RegionStore, ServiceCatalog, Store};
use serde_json::{json, Value};

const DENTISTS: &str = "\
country,province,county,city,name,description,address,phone
CA,BC,CRD,Victoria,ABC Dental,Family dentistry,101 Fort St,250-555-0101
CA,BC,CRD,Saanich,Smile Studio,Cosmetic work,9 Quadra St,
CA,BC,,,Provincial Dental Line,Referral service,1 Government St,
";

const EDUCATION: &str = "\
Country,State,District,Town,Organisation,Description,Address,URL
CA,BC,CRD,Victoria,Access Learning,Tutoring,5 Elm St,https://access.example
UK,England,,,
";

fn write_fixture(dir: &Path) {
    fs::write(dir.join("Dentist.csv"), DENTISTS).unwrap();
    fs::write(dir.join("Education.csv"), EDUCATION).unwrap();
    fs::write(dir.join("notes.txt"), "not a csv").unwrap();
}

fn geocoder() -> FixedGeocoder {
    FixedGeocoder::new()
        .with("101 Fort St", GeocodeOutcome::success(48.4243, -123.3626))
        .with("9 Quadra St", GeocodeOutcome::success(48.4500, -123.3600))
        .with("5 Elm St", GeocodeOutcome::success(48.4280, -123.3650))
        .with("1 Government St", GeocodeOutcome::RequestDenied)
}

#[tokio::test]
async fn directory_import_persists_to_sqlite() {
    let data = tempfile::tempdir().unwrap();
    write_fixture(data.path());
    let db = tempfile::tempdir().unwrap();
    let database_url = format!("sqlite://{}", db.path().join("haven.db").display());

    {
        let store = Store::sqlite(&database_url).await.unwrap();
        let pipeline = ImportPipeline::new(store, geocoder());
        let report = pipeline.import_dir(data.path()).await.unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.total.total, 5);
        assert_eq!(report.total.succeeded, 4);
        assert_eq!(report.total.failures_for(FailureReason::RequestDenied), 1);
        assert_eq!(pipeline.geocoder().calls(), 4);
    }

    let store = Store::sqlite(&database_url).await.unwrap();

    let bc = store
        .find_region_by_path(&RegionPath::from_levels(&[Some("CA"), Some("BC"), None, None]).unwrap())
        .await
        .unwrap()
        .expect("BC imported");
    assert_eq!(bc.region_type, RegionType::Province);

    let all = store.query_services(bc.id, true).await.unwrap();
    assert_eq!(all.len(), 4);
    let direct = store.query_services(bc.id, false).await.unwrap();
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].name, "Provincial Dental Line");
    assert!(direct[0].coordinates.is_none());

    assert_eq!(
        store.service_types().await.unwrap(),
        ["Dentist".to_string(), "Education".to_string()]
    );
    assert_eq!(store.list_services(Some("Education")).await.unwrap().len(), 1);

    let england = store
        .find_region_by_path(&RegionPath::from_levels(&[Some("UK"), Some("England"), None, None]).unwrap())
        .await
        .unwrap();
    assert!(england.is_some());

    // a second run only retries the row that never got coordinates
    let pipeline = ImportPipeline::new(store, geocoder());
    let rerun = pipeline.import_dir(data.path()).await.unwrap();
    assert_eq!(rerun.total.already_present, 3);
    assert_eq!(rerun.total.failures_for(FailureReason::RequestDenied), 1);
    assert_eq!(pipeline.geocoder().calls(), 1);
    assert_eq!(pipeline.store().list_services(None).await.unwrap().len(), 4);
}

async fn spawn_google_mock() -> String {
    async fn geocode(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        if params.get("key").map(String::as_str) != Some("test-key") {
            return Json(json!({ "status": "REQUEST_DENIED", "error_message": "bad key" }));
        }
        let body = match params.get("address").map(String::as_str) {
            Some("101 Fort St, Victoria") => json!({
                "status": "OK",
                "results": [{ "geometry": { "location": { "lat": 48.4243, "lng": -123.3626 } } }]
            }),
            Some("nowhere") => json!({ "status": "ZERO_RESULTS", "results": [] }),
            _ => json!({ "status": "OVER_QUERY_LIMIT", "error_message": "slow down" }),
        };
        Json(body)
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/geocode/json", get(geocode));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/geocode/json")
}

#[tokio::test]
async fn google_geocoder_against_local_endpoint() {
    let endpoint = spawn_google_mock().await;
    let geocoder = GoogleGeocoder::with_endpoint(&endpoint, "test-key", Duration::from_secs(5)).unwrap();

    let found = geocoder.geocode("101 Fort St, Victoria").await;
    let coordinates = found.coordinates().expect("located");
    assert!((coordinates.latitude - 48.4243).abs() < 1e-9);

    assert_eq!(geocoder.geocode("nowhere").await, GeocodeOutcome::NotFound);
    assert_eq!(
        geocoder.geocode("elsewhere").await,
        GeocodeOutcome::OtherFailure {
            detail: "OVER_QUERY_LIMIT: slow down".to_string()
        }
    );

    let denied = GoogleGeocoder::with_endpoint(&endpoint, "wrong", Duration::from_secs(5)).unwrap();
    assert_eq!(denied.geocode("nowhere").await, GeocodeOutcome::RequestDenied);
}

#[tokio::test]
async fn unreachable_endpoint_is_other_failure() {
    let geocoder =
        GoogleGeocoder::with_endpoint("http://127.0.0.1:9/geocode/json", "k", Duration::from_secs(2))
            .unwrap();
    let outcome = geocoder.geocode("101 Fort St").await;
    assert_eq!(outcome.failure_reason(), Some(FailureReason::OtherFailure));
}
