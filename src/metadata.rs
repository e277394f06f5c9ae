//! The piggyback codec: control signals carried as plain HTTP/2 headers on
//! the ordinary request/response path.

use http::header::{HeaderMap, HeaderValue};
use uuid::Uuid;

/// Request header: number of requests waiting in the client's queue.
pub const DEMAND_HEADER: &str = "demand";
/// Request header: the client's identity, UUID text form.
pub const CLIENT_ID_HEADER: &str = "id";
/// Request header: per-request id, UUID text form.
pub const REQUEST_ID_HEADER: &str = "reqid";
/// Response header: the credit grant for this client.
pub const CREDITS_HEADER: &str = "credits";

/// The client-side signals attached to every admitted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestTags {
    pub demand: i64,
    pub client: Uuid,
    pub request: Uuid,
}

/// Parse the piggybacked request signals, or `None` when any of them is
/// missing or malformed.
pub fn request_tags(headers: &HeaderMap) -> Option<RequestTags> {
    let demand = int_header(headers, DEMAND_HEADER)?;
    if demand < 0 {
        return None;
    }
    let client = uuid_header(headers, CLIENT_ID_HEADER)?;
    let request = uuid_header(headers, REQUEST_ID_HEADER)?;
    Some(RequestTags {
        demand,
        client,
        request,
    })
}

pub fn apply_request_tags(headers: &mut HeaderMap, tags: &RequestTags) {
    headers.insert(DEMAND_HEADER, int_value(tags.demand));
    headers.insert(CLIENT_ID_HEADER, uuid_value(tags.client));
    headers.insert(REQUEST_ID_HEADER, uuid_value(tags.request));
}

/// The request id already attached to a relayed call, if any.
pub fn request_id(headers: &HeaderMap) -> Option<Uuid> {
    uuid_header(headers, REQUEST_ID_HEADER)
}

/// The credit grant piggybacked on a response, if any.
pub fn credits(headers: &HeaderMap) -> Option<i64> {
    int_header(headers, CREDITS_HEADER)
}

pub fn apply_credits(headers: &mut HeaderMap, credits: i64) {
    headers.insert(CREDITS_HEADER, int_value(credits));
}

fn int_header(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn uuid_header(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn int_value(value: i64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("decimal integers are valid header values")
}

fn uuid_value(value: Uuid) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("hyphenated UUIDs are valid header values")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_tags_round_trip() {
        let tags = RequestTags {
            demand: 17,
            client: Uuid::new_v4(),
            request: Uuid::new_v4(),
        };
        let mut headers = HeaderMap::new();
        apply_request_tags(&mut headers, &tags);
        assert_eq!(request_tags(&headers), Some(tags));
        assert_eq!(request_id(&headers), Some(tags.request));
    }

    #[test]
    fn missing_headers_are_malformed() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_tags(&headers), None);

        headers.insert(DEMAND_HEADER, HeaderValue::from_static("3"));
        headers.insert(CLIENT_ID_HEADER, uuid_value(Uuid::new_v4()));
        assert_eq!(request_tags(&headers), None);
    }

    #[test]
    fn negative_demand_is_malformed() {
        let tags = RequestTags {
            demand: 0,
            client: Uuid::new_v4(),
            request: Uuid::new_v4(),
        };
        let mut headers = HeaderMap::new();
        apply_request_tags(&mut headers, &tags);
        headers.insert(DEMAND_HEADER, HeaderValue::from_static("-4"));
        assert_eq!(request_tags(&headers), None);
    }

    #[test]
    fn garbage_uuid_is_malformed() {
        let tags = RequestTags {
            demand: 1,
            client: Uuid::new_v4(),
            request: Uuid::new_v4(),
        };
        let mut headers = HeaderMap::new();
        apply_request_tags(&mut headers, &tags);
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert_eq!(request_tags(&headers), None);
    }

    #[test]
    fn credits_parse_and_apply() {
        let mut headers = HeaderMap::new();
        assert_eq!(credits(&headers), None);
        apply_credits(&mut headers, 42);
        assert_eq!(credits(&headers), Some(42));
    }
}
