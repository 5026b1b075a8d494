//! Mock origin serving landing pages, catalogs, listings, resolutions and files

use serde_json::{Value, json};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Organization code used throughout the scenarios
pub const ORG_CODE: &str = "abc";

/// Catalog token embedded in the landing page
pub const CATALOG_TOKEN: &str = "tok123";

/// A mock course platform
pub struct MockOrigin {
    /// Underlying wiremock server
    pub server: MockServer,
}

impl MockOrigin {
    /// Start an origin whose landing page for [`ORG_CODE`] carries [`CATALOG_TOKEN`]
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/site/{ORG_CODE}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<html><script>window.__STATE__={{"org":{{"hash":"{CATALOG_TOKEN}"}}}}</script></html>"#
            )))
            .mount(&server)
            .await;
        Self { server }
    }

    /// Serve the catalog as `(course_id, name)` pairs
    pub async fn catalog(&self, courses: &[(i64, &str)]) {
        let data: Vec<Value> = courses
            .iter()
            .map(|(id, name)| json!({"id": id, "name": name, "finalPrice": 0}))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/v2/course/preview/similar/{CATALOG_TOKEN}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"coursesData": data}})),
            )
            .mount(&self.server)
            .await;
    }

    /// Hand out `token` for `course_id`
    pub async fn course_token(&self, course_id: i64, token: &str) {
        Mock::given(method("GET"))
            .and(path("/v2/course/preview/org/info"))
            .and(query_param("courseId", course_id.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"hash": token}})))
            .mount(&self.server)
            .await;
    }

    /// List `children` (`id`, `contentType`, `name`) for `folder_id` of the course behind `token`
    pub async fn folder(&self, token: &str, folder_id: i64, children: &[(i64, i64, &str)]) {
        self.slow_folder(token, folder_id, children, Duration::ZERO)
            .await;
    }

    /// Like [`MockOrigin::folder`], answering only after `delay`
    pub async fn slow_folder(
        &self,
        token: &str,
        folder_id: i64,
        children: &[(i64, i64, &str)],
        delay: Duration,
    ) {
        let data: Vec<Value> = children
            .iter()
            .map(|(id, kind, name)| json!({"id": id, "contentType": kind, "name": name}))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/v2/course/preview/content/list/{token}")))
            .and(query_param("folderId", folder_id.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": data}))
                    .set_delay(delay),
            )
            .mount(&self.server)
            .await;
    }

    /// Resolve `content_id` to the file served at `file_path`
    pub async fn resolves_to(&self, content_id: i64, file_path: &str) {
        let url = format!("{}{file_path}", self.server.uri());
        Mock::given(method("GET"))
            .and(path(resolve_path(content_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"url": url}})))
            .mount(&self.server)
            .await;
    }

    /// Answer resolution of `content_id` with `status`, expecting `calls` requests
    pub async fn resolve_fails(&self, content_id: i64, status: u16, calls: u64) {
        Mock::given(method("GET"))
            .and(path(resolve_path(content_id)))
            .respond_with(ResponseTemplate::new(status))
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Serve `body` at `file_path`, expecting exactly `transfers` requests
    pub async fn file(&self, file_path: &str, body: &[u8], transfers: u64) {
        Mock::given(method("GET"))
            .and(path(file_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(transfers)
            .mount(&self.server)
            .await;
    }

    /// The sample course: "Notes/Ch1.pdf" and "Intro.pdf"
    pub async fn sample_course(&self) {
        self.catalog(&[(7, "Sample Prep")]).await;
        self.course_token(7, "course-tok").await;
        self.folder("course-tok", 0, &[(1, 1, "Notes"), (2, 3, "Intro.pdf")])
            .await;
        self.folder("course-tok", 1, &[(3, 3, "Ch1.pdf")]).await;
    }
}

fn resolve_path(content_id: i64) -> String {
    format!("/v2/course/preview/document/download/{content_id}")
}
