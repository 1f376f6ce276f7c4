mod client;
mod basic;
pub mod auth;

pub use client::HttpClient;
pub use basic::BasicClient;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

/// Issues a GET and decodes the JSON body.
///
/// A `404 Not Found` is reported as `Ok(None)`: the trip API uses it for
/// "no position yet" and "no route assigned".
pub async fn get_json<C, T>(client: &C, url: &str) -> Result<Option<T>>
where
    C: HttpClient + ?Sized,
    T: DeserializeOwned,
{
    let bytes = match get_bytes(client, url).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("decoding {url}"))?;
    Ok(Some(value))
}

pub async fn get_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Option<Vec<u8>>> {
    let req = reqwest::Request::new(
        reqwest::Method::GET,
        url.parse::<reqwest::Url>().with_context(|| format!("invalid url '{url}'"))?,
    );

    let resp = client.execute(req).await.with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("GET {url} returned status {status}: {body}");
    }
    Ok(Some(resp.bytes().await?.to_vec()))
}
