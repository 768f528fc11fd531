use std::{collections::BTreeMap, iter::FromIterator};

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use ruma::{api::federation::authentication::XMatrix, CanonicalJsonValue, OwnedServerName};
use tracing::warn;

use crate::{services, utils::constant_time_eq, Error, Result};

/// Verifies `Authorization: Bearer <token>` against the configured
/// admission secret, comparing SHA-256 digests in constant time rather than
/// the raw bytes (§6: "compared with constant-time SHA-256 equality").
pub struct AdmissionAuth;

#[async_trait]
impl<S> FromRequestParts<S> for AdmissionAuth
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| Error::BadRequest(ruma::api::client::error::ErrorKind::MissingToken, "Missing bearer token."))?;

        let expected = &services().globals.config.admission_secret;
        let provided_hash = crate::utils::sha256(bearer.token().as_bytes());
        let expected_hash = crate::utils::sha256(expected.as_bytes());
        if !constant_time_eq(&provided_hash, &expected_hash) {
            return Err(Error::BadRequest(ruma::api::client::error::ErrorKind::forbidden(), "Invalid admission token."));
        }
        Ok(Self)
    }
}

/// Verifies the homeserver's own appservice push token (the `hs_token` from
/// the registration), used on the `/_matrix/app/v1/transactions/{txnId}`
/// surface.
pub struct AppserviceAuth;

#[async_trait]
impl<S> FromRequestParts<S> for AppserviceAuth
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| Error::AppserviceHandshakeRejected("missing hs_token"))?;

        let expected = &services().globals.config.appservice.hs_token;
        let provided_hash = crate::utils::sha256(bearer.token().as_bytes());
        let expected_hash = crate::utils::sha256(expected.as_bytes());
        if !constant_time_eq(&provided_hash, &expected_hash) {
            return Err(Error::AppserviceHandshakeRejected("hs_token mismatch"));
        }
        Ok(Self)
    }
}

/// A request authenticated via an X-Matrix `Authorization` header: the
/// federation signature technique the teacher's `Ruma<T>` extractor uses
/// for `AuthScheme::ServerSignatures` routes, adapted here to a plain body
/// instead of a `ruma::api::IncomingRequest` (the policy-server surface is a
/// small custom endpoint, not the full client-server API).
pub struct XMatrixVerified {
    pub origin: OwnedServerName,
}

impl XMatrixVerified {
    /// Verifies the request's X-Matrix signature against `body`, the exact
    /// value that was signed as the request's `content`.
    pub async fn verify(parts: &Parts, body: &CanonicalJsonValue) -> Result<Self> {
        let TypedHeader(Authorization(x_matrix)) =
            TypedHeader::<Authorization<XMatrix>>::from_request_parts(&mut parts.clone(), &())
                .await
                .map_err(|_| Error::BadRequest(ruma::api::client::error::ErrorKind::forbidden(), "Missing or invalid X-Matrix Authorization header."))?;

        if let Some(dest) = &x_matrix.destination {
            if dest != &services().globals.server_name() {
                return Err(Error::BadRequest(
                    ruma::api::client::error::ErrorKind::Unauthorized,
                    "X-Matrix destination does not match our server name.",
                ));
            }
        }

        let origin_signatures = BTreeMap::from_iter([(x_matrix.key.clone(), CanonicalJsonValue::String(x_matrix.sig.clone()))]);
        let signatures = BTreeMap::from_iter([(
            x_matrix.origin.as_str().to_owned(),
            CanonicalJsonValue::Object(origin_signatures.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        )]);

        let mut request_map = BTreeMap::from_iter([
            ("method".to_owned(), CanonicalJsonValue::String(parts.method.to_string())),
            ("uri".to_owned(), CanonicalJsonValue::String(parts.uri.to_string())),
            ("origin".to_owned(), CanonicalJsonValue::String(x_matrix.origin.as_str().to_owned())),
            (
                "destination".to_owned(),
                CanonicalJsonValue::String(services().globals.server_name().as_str().to_owned()),
            ),
            ("signatures".to_owned(), CanonicalJsonValue::Object(signatures)),
        ]);
        request_map.insert("content".to_owned(), body.clone());

        let verify_keys = services().globals.verify_keys(&x_matrix.origin).await.map_err(|e| {
            warn!(origin = %x_matrix.origin, error = %e, "failed to fetch signing keys");
            Error::BadRequest(ruma::api::client::error::ErrorKind::forbidden(), "Failed to fetch signing keys.")
        })?;
        let pub_key_map = BTreeMap::from_iter([(x_matrix.origin.as_str().to_owned(), verify_keys)]);

        ruma::signatures::verify_json(&pub_key_map, &request_map).map_err(|e| {
            warn!(origin = %x_matrix.origin, error = %e, "X-Matrix signature verification failed");
            Error::BadRequest(ruma::api::client::error::ErrorKind::forbidden(), "Failed to verify X-Matrix signature.")
        })?;

        Ok(Self { origin: x_matrix.origin })
    }
}
