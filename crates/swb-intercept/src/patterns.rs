//! Curated pattern sets the classifier matches against.
//!
//! Hosts match exactly or as a subdomain; URL indicators are plain
//! case-insensitive substring checks. The lists are deliberately broad:
//! a false positive blocks one media asset, a false negative on the
//! verification side breaks a whole site.

/// Anti-bot and captcha infrastructure. Requests to these hosts are
/// never blocked.
pub const VERIFICATION_HOSTS: &[&str] = &[
    "recaptcha.net",
    "www.recaptcha.net",
    "api2.recaptcha.net",
    "challenges.cloudflare.com",
    "captcha-api.cloudflare.com",
    "turnstile.cloudflare.com",
    "hcaptcha.com",
    "newassets.hcaptcha.com",
    "js.hcaptcha.com",
    "api.hcaptcha.com",
    "assets.hcaptcha.com",
    "imgs.hcaptcha.com",
    "recaptcha.google.com",
    "www.recaptcha.google.com",
    "datadome.co",
    "api-js.datadome.co",
    "captcha-delivery.com",
    "geo.captcha-delivery.com",
    "t.captcha-delivery.com",
    "perimeterx.net",
    "px-cdn.net",
    "px-cdn.perimeterx.net",
    "arkoselabs.com",
    "client-api.arkoselabs.com",
    "iframe.arkoselabs.com",
    "api.arkoselabs.com",
    "funcaptcha.com",
    "geetest.com",
    "api.geetest.com",
    "static.geetest.com",
    "botdetect.com",
    "kasada.io",
    "kasada.com",
    "imperva.com",
    "incapsula.com",
    "sucuri.net",
    "sucuri.com",
    "distilnetworks.com",
    "distil.io",
    "shapesecurity.com",
    "shape.security",
    "f5.com",
    "akamai.com",
    "akamaihd.net",
    "akamaized.net",
    "radware.com",
];

pub const VERIFICATION_URL_INDICATORS: &[&str] = &[
    "/recaptcha/",
    "recaptcha/api",
    "g-recaptcha",
    "grecaptcha",
    "g-recaptcha-response",
    "hcaptcha",
    "turnstile",
    "cf-chl",
    "cf_chl",
    "__cf_chl",
    "__cf_bm",
    "cf_bm",
    "cf-bm",
    "/cdn-cgi/challenge-platform/",
    "/cdn-cgi/challenge",
    "/cdn-cgi/turnstile",
    "/cdn-cgi/l/chk_captcha",
    "/cdn-cgi/bm/",
    "/captcha",
    "captcha=",
    "captcha/",
    "captcha-",
    "captcha?",
    "botcheck",
    "bot-check",
    "browser-check",
    "browsercheck",
    "/challenge",
    "challenge=",
    "challenge/",
    "challenge-platform",
    "arkoselabs",
    "funcaptcha",
    "perimeterx",
    "pxcaptcha",
    "px-captcha",
    "px_challenge",
    "datadome",
    "captcha-delivery",
    "geetest",
    "botdetect",
    "distil",
    "distil_r_captcha",
    "kpsdk",
    "kasada",
    "incapsula",
    "_incapsula_resource",
    "sucuri",
    "awswaf",
    "aws-waf",
    "waf-captcha",
    "wafcaptcha",
    "/akamai/",
    "/akamai/bm",
    "/_bm",
    "akamai",
    "bm-verify",
    "bm_verify",
    "ak_bmsc",
    "abck",
    "sensor_data",
];

/// Ad-network host fragments. Substring matches against the host.
pub const AD_HOST_PATTERNS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "googleadservices.com",
    "adservice.google",
    "pagead2.",
    "tpc.googlesyndication",
    "adnxs.com",
    "adsystem.com",
    "scorecardresearch",
    "moatads",
    "facebook.com/tr",
    "connect.facebook.net/signals",
    "ads.",
    "ad.",
    "banner.",
    "adv.",
];

pub const AD_URL_PATTERNS: &[&str] = &[
    "/ads/",
    "/ad/",
    "/banner/",
    "/adv/",
    "doubleclick",
    "pagead",
    "googlesyndication",
    "googleadservices",
    "adsystem",
    "adserver",
];

/// Blocked media extensions. Favicons and fonts stay loadable.
pub const BLOCKED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".bmp", ".mp4", ".webm", ".ogg", ".mp3",
    ".wav", ".m4a", ".avi", ".mov", ".m3u8", ".m3u", ".ts", ".m4s", ".m4v", ".mpd", ".f4m",
    ".f4v", ".ismv", ".isma", ".ism", ".m4f", ".mkv", ".flv", ".3gp", ".aac", "header.mp4",
    "init.m4s",
];

pub const IMAGE_EXTENSIONS: &[&str] =
    &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];

/// Streaming and segmented-media URL shapes, path and query alike.
pub const BLOCKED_VIDEO_URL_PATTERNS: &[&str] = &[
    ".m3u8",
    ".m3u",
    ".mpd",
    ".ts",
    ".m4s",
    ".m4v",
    ".f4m",
    ".f4v",
    "init.mp4",
    "header.mp4",
    "/stream",
    "/stream/",
    "/streams/",
    "/hls/",
    "/hls-",
    "/dash/",
    "/hds/",
    "/hds-vod/",
    "/segment",
    "/segments/",
    "/fragments/",
    "/chunk",
    "/chunks/",
    "frag.ts",
    "chunk.ts",
    "/mp4/",
    "/webm/",
    "/video/",
    "/videos/",
    "/vid/",
    "/video_id/",
    "/media/",
    "/smooth/",
    "/ism/",
    "/play/",
    "/player/",
    "/manifest/",
    "/live/",
    "/vod/",
    "/cdn/",
    "/delivery/",
    "/adaptive/",
    "/abr/",
    "/get_video",
    "/load_media",
    "/api/video",
    "/fetch_segment",
    "/qualitylevels=",
    ".bootstrap",
    "videoplayback",
    "video_redirect",
    "master.m3u8",
    "master.f4m",
    "format=mp4",
    "type=video",
    "video=1",
    "mime=video",
    "segment=",
    "fragment=",
    "quality=hd",
    "quality=sd",
    "res=1080",
    "res=720",
    "res=480",
    "bitrate=",
    "profile=",
    "variant=",
    "playlist=",
    "manifest=",
    "key=",
    "token=",
    "expires=",
    "signature=",
    "auth=",
    "drm=",
    "license=",
    "widevine=",
    "playready=",
    "range=bytes",
];

/// `Accept` header fragments marking a fetch/XHR media request.
pub const VIDEO_ACCEPT_PATTERNS: &[&str] =
    &["video/", "application/vnd.apple.mpegurl", "application/x-mpegurl"];

/// Host or URL hits the verification infrastructure lists. The Google
/// conjunction catches captcha assets served off generic Google CDNs.
pub fn is_verification_request(host: &str, url: &str) -> bool {
    let host = host.to_lowercase();
    let url = url.to_lowercase();
    if VERIFICATION_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")))
    {
        return true;
    }
    if VERIFICATION_URL_INDICATORS.iter().any(|p| url.contains(p)) {
        return true;
    }
    (host.contains("google") || host.contains("gstatic.com") || host.contains("googleusercontent.com"))
        && (url.contains("recaptcha") || url.contains("captcha"))
}

pub fn is_ad_request(host: &str, url: &str) -> bool {
    let host = host.to_lowercase();
    let url = url.to_lowercase();
    AD_HOST_PATTERNS.iter().any(|p| host.contains(p))
        || AD_URL_PATTERNS.iter().any(|p| url.contains(p))
}

/// Real path extension only; query-based matches produce too many
/// false positives on document URLs.
pub fn path_has_blocked_extension(path: &str) -> bool {
    let path = path.to_lowercase();
    BLOCKED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

pub fn is_image_url(path: &str, url: &str) -> bool {
    let path = path.to_lowercase();
    let url = url.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| {
        path.ends_with(ext) || url.contains(&format!("{ext}?")) || url.contains(&format!("{ext}&"))
    })
}

/// Subresource media check: blocked extension anywhere in path or URL,
/// or a streaming URL shape. CSS/JS/JSON are never media.
pub fn is_blocked_resource(path: &str, url: &str) -> bool {
    let path = path.to_lowercase();
    let url = url.to_lowercase();
    if path.ends_with(".css") || url.contains(".css?") {
        return false;
    }
    if path.ends_with(".js")
        || path.ends_with(".mjs")
        || url.contains(".js?")
        || url.contains(".mjs?")
    {
        return false;
    }
    if path.ends_with(".json") || url.contains(".json?") {
        return false;
    }
    BLOCKED_EXTENSIONS.iter().any(|ext| path.contains(ext))
        || BLOCKED_EXTENSIONS.iter().any(|ext| url.contains(ext))
        || BLOCKED_VIDEO_URL_PATTERNS.iter().any(|p| url.contains(p))
}

pub fn accept_indicates_video(accept: &str) -> bool {
    let accept = accept.to_lowercase();
    VIDEO_ACCEPT_PATTERNS.iter().any(|p| accept.contains(p))
}

pub fn accept_indicates_css_js_json(accept: &str) -> bool {
    let accept = accept.to_lowercase();
    accept.contains("text/css") || accept.contains("javascript") || accept.contains("json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_hosts_match_subdomains() {
        assert!(is_verification_request("recaptcha.net", "https://recaptcha.net/x"));
        assert!(is_verification_request(
            "api2.recaptcha.net",
            "https://api2.recaptcha.net/anchor"
        ));
        assert!(!is_verification_request("example.com", "https://example.com/"));
    }

    #[test]
    fn google_hosts_need_a_captcha_url_too() {
        assert!(is_verification_request(
            "www.gstatic.com",
            "https://www.gstatic.com/recaptcha/releases/x.js"
        ));
        assert!(!is_verification_request(
            "www.gstatic.com",
            "https://www.gstatic.com/fonts/roboto.woff2"
        ));
    }

    #[test]
    fn ads_match_by_host_or_url() {
        assert!(is_ad_request("stats.doubleclick.net", "https://stats.doubleclick.net/r"));
        assert!(is_ad_request("cdn.example.com", "https://cdn.example.com/ads/banner.html"));
        assert!(!is_ad_request("example.com", "https://example.com/reader"));
    }

    #[test]
    fn css_js_json_are_never_blocked_resources() {
        assert!(!is_blocked_resource("/app.css", "https://x.test/app.css?v=.mp4"));
        assert!(!is_blocked_resource("/app.js", "https://x.test/app.js?x=1"));
        assert!(!is_blocked_resource("/data.json", "https://x.test/data.json"));
        assert!(is_blocked_resource("/clip.mp4", "https://x.test/clip.mp4"));
        assert!(is_blocked_resource("/seg", "https://x.test/hls/seg?quality=hd"));
    }

    #[test]
    fn image_extension_matches_path_and_query_forms() {
        assert!(is_image_url("/a/photo.jpg", "https://x.test/a/photo.jpg"));
        assert!(is_image_url("/img", "https://x.test/img.png?w=100"));
        assert!(!is_image_url("/clip.mp4", "https://x.test/clip.mp4"));
    }
}
