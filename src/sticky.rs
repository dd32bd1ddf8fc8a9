//! `__VCAP_ID__` sticky-session cookie decision tree (§4.E). Hand-built `http::HeaderValue`
//! construction rather than a cookie-jar dependency: nothing in the teacher's stack reaches for
//! a `cookie` crate, and the header this module emits has a fixed, small attribute set.

use http::{HeaderMap, HeaderValue, header};

pub const VCAP_ID_COOKIE: &str = "__VCAP_ID__";

/// The subset of §6 configuration this decision tree consults.
#[derive(Debug, Clone, Default)]
pub struct StickyConfig {
	pub cookie_names: Vec<String>,
	pub sticky_sessions_for_auth_negotiate: bool,
	pub secure_cookies: bool,
}

#[derive(Debug, Clone, Default)]
struct CookieAttrs {
	secure: bool,
	same_site: Option<String>,
	max_age: Option<String>,
	expires: Option<String>,
	partitioned: bool,
}

/// Finds `name`'s value in a `Cookie:` request header, which is a single `;`-joined list of
/// `name=value` pairs with no per-cookie attributes.
fn find_request_cookie(header_value: &str, name: &str) -> Option<String> {
	header_value.split(';').find_map(|part| {
		let (k, v) = part.trim().split_once('=')?;
		(k.trim() == name).then(|| v.trim().to_string())
	})
}

/// Parses one `Set-Cookie:` response header value into (name, value, attributes). Unknown
/// attributes are ignored; attribute names are matched case-insensitively per RFC 6265.
fn parse_set_cookie(header_value: &str) -> (String, String, CookieAttrs) {
	let mut parts = header_value.split(';');
	let (name, value) = parts
		.next()
		.and_then(|kv| kv.split_once('='))
		.map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
		.unwrap_or_default();

	let mut attrs = CookieAttrs::default();
	for attr in parts {
		let attr = attr.trim();
		let (key, val) = match attr.split_once('=') {
			Some((k, v)) => (k.trim(), Some(v.trim().to_string())),
			None => (attr, None),
		};
		match key.to_ascii_lowercase().as_str() {
			"secure" => attrs.secure = true,
			"samesite" => attrs.same_site = val,
			"max-age" => attrs.max_age = val,
			"expires" => attrs.expires = val,
			"partitioned" => attrs.partitioned = true,
			_ => {},
		}
	}
	(name, value, attrs)
}

fn response_sets_cookie_named(response_headers: &HeaderMap, name: &str) -> bool {
	response_headers
		.get_all(header::SET_COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.any(|v| parse_set_cookie(v).0 == name)
}

/// The private-instance-id the request's `Cookie:` header was already pinned to, if any.
fn request_pin(request_cookie_header: Option<&HeaderValue>) -> Option<String> {
	find_request_cookie(request_cookie_header?.to_str().ok()?, VCAP_ID_COOKIE)
}

/// Decides whether a successful response should carry a `Set-Cookie: __VCAP_ID__=...`, and
/// builds it if so. `serving_private_instance_id` is the endpoint that actually served the
/// request; an empty id means the endpoint never reports affinity and no cookie is ever set.
pub fn sticky_cookie(
	config: &StickyConfig,
	context_path: &str,
	request_cookie_header: Option<&HeaderValue>,
	response_headers: &HeaderMap,
	serving_private_instance_id: &str,
) -> Option<HeaderValue> {
	if serving_private_instance_id.is_empty() {
		return None;
	}
	if response_sets_cookie_named(response_headers, VCAP_ID_COOKIE) {
		return None;
	}

	let pin_drifted = request_pin(request_cookie_header).is_some_and(|pin| pin != serving_private_instance_id);

	let matched_sticky_cookie = response_headers
		.get_all(header::SET_COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.map(parse_set_cookie)
		.find(|(name, _, _)| config.cookie_names.iter().any(|n| n.eq_ignore_ascii_case(name)))
		.map(|(_, _, attrs)| attrs);

	let negotiate_requested = config.sticky_sessions_for_auth_negotiate
		&& response_headers
			.get(header::WWW_AUTHENTICATE)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.trim().to_ascii_lowercase().starts_with("negotiate"));

	if !pin_drifted && matched_sticky_cookie.is_none() && !negotiate_requested {
		return None;
	}

	let attrs = match matched_sticky_cookie {
		Some(attrs) => attrs,
		None if negotiate_requested => CookieAttrs {
			max_age: Some("60".to_string()),
			same_site: Some("Strict".to_string()),
			..CookieAttrs::default()
		},
		None => CookieAttrs::default(),
	};

	Some(build_cookie_header(context_path, serving_private_instance_id, &attrs, config.secure_cookies))
}

fn build_cookie_header(path: &str, private_instance_id: &str, attrs: &CookieAttrs, force_secure: bool) -> HeaderValue {
	let path = if path.is_empty() { "/" } else { path };
	let mut out = format!("{VCAP_ID_COOKIE}={private_instance_id}; HttpOnly; Path={path}");
	if force_secure || attrs.secure {
		out.push_str("; Secure");
	}
	if let Some(same_site) = &attrs.same_site {
		out.push_str("; SameSite=");
		out.push_str(same_site);
	}
	if let Some(max_age) = &attrs.max_age {
		out.push_str("; Max-Age=");
		out.push_str(max_age);
	}
	if let Some(expires) = &attrs.expires {
		out.push_str("; Expires=");
		out.push_str(expires);
	}
	if attrs.partitioned {
		out.push_str("; Partitioned");
	}
	HeaderValue::from_str(&out).expect("cookie header built from a restricted character set")
}
