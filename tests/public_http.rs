//! Public children endpoints, driven through the router in-process.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use tajwid_bot::model::{ReadingLevel, UserProfile};
use tajwid_bot::public::public_routes;
use tajwid_bot::store::{Database, LibSqlBackend};

async fn app() -> (Router, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    (public_routes(Arc::clone(&db)), db)
}

async fn seed(db: &dyn Database, user_id: i64, phone: &str, children: Option<(bool, Option<bool>)>) {
    let mut p = UserProfile::new(user_id, "Ali");
    p.phone = Some(phone.into());
    p.has_children = children.map(|(has, _)| has);
    p.children_study_quran = children.and_then(|(_, study)| study);
    p.reading_level = Some(ReadingLevel::ReadWithMistakes);
    p.registration_completed = true;
    db.upsert_profile(&p).await.unwrap();
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn stats_need_a_matching_phone() {
    let (router, db) = app().await;
    seed(db.as_ref(), 1, "+7 900 000-00-01", Some((true, Some(true)))).await;
    seed(db.as_ref(), 2, "+7 900 000-00-02", Some((true, None))).await;
    seed(db.as_ref(), 3, "+7 900 000-00-03", Some((false, None))).await;

    let response = router
        .clone()
        .oneshot(get("/api/public/children/stats?userId=1&phone=79000000001"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({
            "totalUsers": 3,
            "usersWithChildren": 2,
            "usersWithoutChildren": 1,
            "usersWithChildrenStudyQuranTrue": 1,
            "usersWithChildrenStudyQuranFalse": 0,
            "usersWithChildrenStudyQuranUnknown": 1
        })
    );

    for uri in [
        "/api/public/children/stats?userId=1&phone=79000000002",
        "/api/public/children/stats?userId=1&phone=",
        "/api/public/children/stats?userId=42&phone=79000000001",
    ] {
        let response = router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(json_body(response).await, json!({"error": "not found"}));
    }
}

#[tokio::test]
async fn self_returns_own_answers() {
    let (router, db) = app().await;
    seed(db.as_ref(), 1, "+7 900 000-00-01", Some((true, Some(false)))).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/public/children/self",
            &json!({"userId": 1, "phone": "8 (900) 000 00 01"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND, "different digits");

    let response = router
        .oneshot(post_json(
            "/api/public/children/self",
            &json!({"userId": 1, "phone": "+79000000001"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({
            "userId": 1,
            "hasChildren": true,
            "childrenStudyQuran": false,
            "readingLevel": "read_with_mistakes"
        })
    );
}

#[tokio::test]
async fn profile_without_phone_is_not_found() {
    let (router, db) = app().await;
    db.upsert_profile(&UserProfile::new(5, "Ali")).await.unwrap();

    let response = router
        .oneshot(post_json("/api/public/children/self", &json!({"userId": 5, "phone": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
