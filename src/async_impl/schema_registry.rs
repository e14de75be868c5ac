//! This module contains the code specific for the schema registry.

use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{header, RequestBuilder, Response};
use reqwest::{Client, ClientBuilder};
use tracing::debug;

use crate::async_impl::registry_client::RegistryTransport;
use crate::error::{ErrorKind, SRCError};
use crate::schema_registry_common::{
    get_body, url_for_call, RawError, RawRegisteredSchema, SrAuthorization, SrCall,
};

/// Settings used to do the calls to schema registry. For simple cases you can use `SrSettings::new`
/// or the `SrSettingsBuilder`. But you can also use it directly so you can all the available
/// settings from reqwest.
#[derive(Debug, Clone)]
pub struct SrSettings {
    urls: Vec<String>,
    client: Client,
    authorization: SrAuthorization,
}

/// Struct to create an SrSettings when used with multiple url's, authorization, custom headers, or
/// custom timeout.
pub struct SrSettingsBuilder {
    urls: Vec<String>,
    authorization: SrAuthorization,
    headers: DashMap<String, String>,
    proxy: Option<String>,
    no_proxy: bool,
    timeout: Duration,
}

/// Creates a new SrSettings struct that is needed to make calls to the schema registry
/// ```
/// use schema_registry_stream::async_impl::schema_registry::SrSettings;
/// let sr_settings = SrSettings::new(String::from("http://localhost:8081"));
/// ```
impl SrSettings {
    /// Will create a new SrSettings with default values, the url should be fully qualified like
    /// `"http://localhost:8081"`.
    pub fn new(url: String) -> SrSettings {
        SrSettings {
            urls: vec![url],
            client: Client::new(),
            authorization: SrAuthorization::None,
        }
    }

    /// Will create a new SrSettingsBuilder with default values, the url should be fully qualified
    /// like `"http://localhost:8081"`.
    pub fn new_builder(url: String) -> SrSettingsBuilder {
        SrSettingsBuilder {
            urls: vec![url],
            authorization: SrAuthorization::None,
            headers: DashMap::new(),
            proxy: None,
            no_proxy: false,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Builder for SrSettings
/// ```
/// use schema_registry_stream::async_impl::schema_registry::SrSettings;
/// use std::time::Duration;
/// let sr_settings = SrSettings::new_builder(String::from("http://localhost:8081"))
///     .add_url(String::from("http://localhost:8082"))
///     .set_token_authorization("some_json_web_token_for_example")
///     .add_header("foo", "bar")
///     .set_proxy("http://localhost:8888")
///     .set_timeout(Duration::from_secs(5))
///     .build().unwrap();
/// ```
impl SrSettingsBuilder {
    /// Adds an url. For any call urls will be tried in order. the one used to create the settings
    /// struct first. All urls should be fully qualified.
    pub fn add_url(&mut self, url: String) -> &mut SrSettingsBuilder {
        self.urls.push(url);
        self
    }

    /// Sets the token that needs to be used to authenticate
    pub fn set_token_authorization(&mut self, token: &str) -> &mut SrSettingsBuilder {
        self.authorization = SrAuthorization::Token(String::from(token));
        self
    }

    /// Sets basic authentication, for confluent cloud, the username is the API Key and the password
    /// is the API Secret.
    pub fn set_basic_authorization(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> &mut SrSettingsBuilder {
        self.authorization =
            SrAuthorization::Basic(String::from(username), password.map(String::from));
        self
    }

    /// Adds a custom header that will be added to every call.
    pub fn add_header(&mut self, key: &str, value: &str) -> &mut SrSettingsBuilder {
        self.headers.insert(String::from(key), String::from(value));
        self
    }

    /// Sets a proxy that will be used for every call.
    pub fn set_proxy(&mut self, proxy_url: &str) -> &mut SrSettingsBuilder {
        self.proxy = Some(String::from(proxy_url));
        self
    }

    /// prevents using any proxy to every call.
    pub fn no_proxy(&mut self) -> &mut SrSettingsBuilder {
        self.no_proxy = true;
        self
    }

    /// Set a timeout, it will be used for the connect and the read.
    pub fn set_timeout(&mut self, duration: Duration) -> &mut SrSettingsBuilder {
        self.timeout = duration;
        self
    }

    /// Build the settings with your own HTTP client.
    ///
    /// The other values (headers, proxy, etc.) are still merged in and take precedence over the
    /// configuration of the supplied builder.
    pub fn build_with(&mut self, builder: ClientBuilder) -> Result<SrSettings, SRCError> {
        let client = self.build_client(builder)?;
        Ok(SrSettings {
            urls: self.urls.clone(),
            client,
            authorization: self.authorization.clone(),
        })
    }

    /// Build the settings.
    ///
    /// If you need your own client, see `build_with`.
    pub fn build(&mut self) -> Result<SrSettings, SRCError> {
        self.build_with(Client::builder())
    }

    fn build_client(&mut self, mut builder: ClientBuilder) -> Result<Client, SRCError> {
        if !self.headers.is_empty() {
            let mut header_map = header::HeaderMap::new();
            for ref_multi in self.headers.iter() {
                let header_name = HeaderName::from_bytes(ref_multi.key().as_bytes()).map_err(|e| {
                    SRCError::non_retryable_with_cause(
                        ErrorKind::Transport,
                        e,
                        &format!("could not create HeaderName from {}", ref_multi.key()),
                    )
                })?;
                let header_value = HeaderValue::from_str(ref_multi.value()).map_err(|e| {
                    SRCError::non_retryable_with_cause(
                        ErrorKind::Transport,
                        e,
                        &format!("could not create HeaderValue for {}", ref_multi.key()),
                    )
                })?;
                header_map.insert(header_name, header_value);
            }
            builder = builder.default_headers(header_map);
        }
        if let Some(proxy) = &self.proxy {
            match reqwest::Proxy::all(proxy) {
                Ok(v) => builder = builder.proxy(v),
                Err(e) => {
                    return Err(SRCError::non_retryable_with_cause(
                        ErrorKind::Transport,
                        e,
                        "invalid proxy value",
                    ))
                }
            };
        }
        if self.no_proxy {
            builder = builder.no_proxy()
        }
        builder = builder.timeout(self.timeout);
        builder.build().map_err(|e| {
            SRCError::non_retryable_with_cause(ErrorKind::Transport, e, "could not create new client")
        })
    }
}

/// Gets a schema by an id. This is used to get the correct schema te deserialize bytes, with the
/// id that is encoded in the bytes.
pub async fn get_schema_by_id(id: u32, sr_settings: &SrSettings) -> Result<String, SRCError> {
    let raw_schema = perform_sr_call(sr_settings, SrCall::GetById(id)).await?;
    match raw_schema.schema {
        Some(v) => Ok(v),
        None => Err(SRCError::non_retryable_without_cause(
            ErrorKind::Registry,
            "Could not get raw schema from response",
        )),
    }
}

/// Handles posting the schema, and getting back the id. When the schema is already in the schema
/// registry, the matching id is returned. When it's not it depends on the settings of the schema
/// registry. The default config will check if the schema is backwards compatible. One of the ways
/// to do this is to add a default value for new fields.
pub async fn post_schema(
    sr_settings: &SrSettings,
    subject: &str,
    schema: &str,
) -> Result<u32, SRCError> {
    let body = get_body(schema);
    let sr_call = SrCall::PostNew(subject, &body);
    let raw_schema = perform_sr_call(sr_settings, sr_call).await?;
    match raw_schema.id {
        Some(v) => Ok(v),
        None => Err(SRCError::non_retryable_without_cause(
            ErrorKind::Registry,
            &format!("Could not get id from response for {:?}", sr_call),
        )),
    }
}

/// Tries the urls in order, returning the first successful answer or the error of the last url.
pub async fn perform_sr_call(
    sr_settings: &SrSettings,
    sr_call: SrCall<'_>,
) -> Result<RawRegisteredSchema, SRCError> {
    let url_count = sr_settings.urls.len();
    let mut n = 0;
    loop {
        let result = perform_single_sr_call(
            &sr_settings.urls[n],
            &sr_settings.client,
            &sr_settings.authorization,
            sr_call,
        )
        .await;
        if result.is_ok() || n + 1 == url_count {
            break result;
        }
        debug!(url = %sr_settings.urls[n], "schema registry call failed, trying next url");
        n += 1
    }
}

async fn send_with_auth(
    builder: RequestBuilder,
    authentication: &SrAuthorization,
) -> Result<Response, SRCError> {
    let res = match authentication {
        SrAuthorization::None => builder.send().await,
        SrAuthorization::Token(token) => builder.bearer_auth(token).send().await,
        SrAuthorization::Basic(username, password) => {
            builder.basic_auth(username, password.as_ref()).send().await
        }
    }
    .map_err(|e| {
        SRCError::retryable_with_cause(
            ErrorKind::Transport,
            e,
            "http call to schema registry failed",
        )
    })?;
    let st = res.status();
    if st.is_success() {
        return Ok(res);
    }
    // Handle non successful HTTP Requests
    let error = format!("HTTP request to schema registry failed with status {}", st);
    let raw_error = res.json::<RawError>().await.unwrap_or_else(|_| RawError {
        error_code: 0,
        message: "couldn't parse schema registry error json".to_owned(),
    });
    Err(match st.as_u16() {
        502 | 503 => SRCError::retryable_with_cause(ErrorKind::Transport, raw_error, &error),
        _ => SRCError::non_retryable_with_cause(ErrorKind::Registry, raw_error, &error),
    })
}

async fn perform_single_sr_call(
    base_url: &str,
    client: &Client,
    authentication: &SrAuthorization,
    sr_call: SrCall<'_>,
) -> Result<RawRegisteredSchema, SRCError> {
    let url = url_for_call(&sr_call, base_url);
    let builder = match sr_call {
        SrCall::GetById(_) => client.get(&url),
        SrCall::PostNew(_, body) => client
            .post(&url)
            .body(String::from(body))
            .header(CONTENT_TYPE, "application/vnd.schemaregistry.v1+json")
            .header(ACCEPT, "application/vnd.schemaregistry.v1+json"),
    };
    let successful_response = send_with_auth(builder, authentication).await?;
    successful_response
        .json::<RawRegisteredSchema>()
        .await
        .map_err(|e| {
            SRCError::non_retryable_with_cause(
                ErrorKind::Registry,
                e,
                "could not parse to RawRegisteredSchema",
            )
        })
}

impl RegistryTransport for SrSettings {
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> BoxFuture<'a, Result<u32, SRCError>> {
        post_schema(self, subject, schema).boxed()
    }

    fn fetch_by_id(&self, id: u32) -> BoxFuture<'_, Result<String, SRCError>> {
        get_schema_by_id(id, self).boxed()
    }
}
