//! This module provides a client to talk to a CalDAV calendar

use std::error::Error;

use async_trait::async_trait;
use minidom::Element;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use url::Url;

use crate::config::CaldavConfig;
use crate::ical::{build_vtodo, parse_vtodo};
use crate::task::Task;
use crate::traits::RemoteSource;
use crate::utils::{find_elem, find_elems};

static TODOS_BODY: &str = r#"
    <C:calendar-query xmlns:C="urn:ietf:params:xml:ns:caldav">
    <D:prop xmlns:D="DAV:">
        <D:getetag/>
        <C:calendar-data/>
    </D:prop>
    <C:filter>
        <C:comp-filter name="VCALENDAR">
        <C:comp-filter name="VTODO">
        </C:comp-filter>
        </C:comp-filter>
    </C:filter>
    </C:calendar-query>
"#;

/// A [`RemoteSource`] that talks to a CalDAV server over HTTP
pub struct CalDavRemote {
    url: Url,
    username: String,
    password: Option<String>,
    token: Option<String>,
    http: reqwest::Client,
}

impl CalDavRemote {
    /// Create a client. This does not start a connection
    pub fn new(config: &CaldavConfig) -> Result<Self, Box<dyn Error>> {
        let url = Url::parse(&config.calendar_url)?;
        Ok(Self {
            url,
            username: config.username.clone(),
            password: config.password.clone(),
            token: config.token.clone(),
            http: reqwest::Client::new(),
        })
    }

    fn request(&self, method: Method, url: &Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url.as_str());
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder.basic_auth(self.username.clone(), self.password.clone()),
        }
    }

    /// The URL a new task will be stored under
    fn task_url(&self, uid: &str) -> Result<Url, Box<dyn Error>> {
        let path = format!("{}/{}.ics", self.url.path().trim_end_matches('/'), uid);
        Ok(self.url.join(&path)?)
    }

    fn href_url(&self, href: &str) -> Result<Url, Box<dyn Error>> {
        Ok(self.url.join(href)?)
    }

    /// Resolve the resource URL of a task, falling back to a lookup by uid
    /// for tasks whose href is not known yet
    async fn resolve_url(&self, task: &Task) -> Result<Url, Box<dyn Error>> {
        if let Some(href) = &task.href {
            return self.href_url(href);
        }
        log::debug!("No href for task {}, searching the server", task.uid);
        for remote in self.list().await? {
            if remote.uid == task.uid {
                if let Some(href) = &remote.href {
                    return self.href_url(href);
                }
            }
        }
        Err(format!("task {} does not exist on the server", task.uid).into())
    }

    async fn put(&self, url: &Url, task: &Task, create: bool) -> Result<(), Box<dyn Error>> {
        let ical = build_vtodo(task);
        let mut request = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, "text/calendar")
            .body(ical);
        if create {
            // Refuse to silently overwrite a resource we did not create
            request = request.header("If-None-Match", "*");
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("server returned {} when writing {}", status, url).into());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for CalDavRemote {
    async fn list(&self) -> Result<Vec<Task>, Box<dyn Error>> {
        let method = Method::from_bytes(b"REPORT").expect("cannot create REPORT method.");
        let response = self
            .request(method, &self.url)
            .header("Depth", 1)
            .header(CONTENT_TYPE, "application/xml")
            .body(TODOS_BODY)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("server returned {} to the calendar query", status).into());
        }
        let text = response.text().await?;
        let root: Element = text.parse()?;

        let mut tasks = Vec::new();
        for response in find_elems(&root, "response") {
            let href = match find_elem(response, "href") {
                Some(href) => href.text(),
                None => continue,
            };
            let calendar_data = match find_elem(response, "calendar-data") {
                Some(data) => data.text(),
                None => continue,
            };
            if calendar_data.trim().is_empty() {
                continue;
            }
            match parse_vtodo(&calendar_data, Some(&href)) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    log::warn!("Skipping unparsable item at {}: {}", href, err);
                }
            }
        }
        log::debug!("Fetched {} tasks from {}", tasks.len(), self.url);
        Ok(tasks)
    }

    async fn create(&self, task: &Task) -> Result<Task, Box<dyn Error>> {
        let url = self.task_url(&task.uid)?;
        self.put(&url, task, true).await?;
        let mut created = task.clone();
        created.href = Some(url.path().to_string());
        Ok(created)
    }

    async fn update(&self, task: &Task) -> Result<Task, Box<dyn Error>> {
        let url = self.resolve_url(task).await?;
        self.put(&url, task, false).await?;
        let mut updated = task.clone();
        updated.href = Some(url.path().to_string());
        Ok(updated)
    }

    async fn delete(&self, task: &Task) -> Result<(), Box<dyn Error>> {
        let url = self.resolve_url(task).await?;
        let response = self.request(Method::DELETE, &url).send().await?;
        let status = response.status();
        // Gone already is fine: the point was for it not to exist
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(format!("server returned {} when deleting {}", status, url).into());
        }
        Ok(())
    }
}
