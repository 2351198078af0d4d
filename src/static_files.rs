//! Static content: GET (files, index resolution, autoindex), POST uploads
//! and DELETE under a location's upload path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::config::Location;
use crate::http::request::{parse_form, Request};
use crate::http::response::{chunk_encode, Response, CHUNK_SIZE};

/// Files above this stream with chunked transfer encoding instead of a
/// single Content-Length body.
const LARGE_FILE_THRESHOLD: u64 = 4 * CHUNK_SIZE as u64;

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn handle(request: &Request, location: &Location) -> Response {
    if request.path.contains("..") {
        return Response::error(400, Some(location));
    }
    match request.method.as_str() {
        "GET" => handle_get(request, location),
        "POST" => handle_post(request, location),
        "DELETE" => handle_delete(request, location),
        _ => Response::error(405, Some(location)),
    }
}

/// Maps a request path onto the location's root, nginx-style:
/// root `www` + path `/a/b.html` is `www/a/b.html`.
fn resolve_path(location: &Location, path: &str) -> PathBuf {
    Path::new(&location.root).join(path.trim_start_matches('/'))
}

fn handle_get(request: &Request, location: &Location) -> Response {
    let mut fs_path = resolve_path(location, &request.path);

    if fs_path.is_dir() {
        match location
            .index
            .iter()
            .map(|index| fs_path.join(index))
            .find(|candidate| candidate.is_file())
        {
            Some(index_path) => fs_path = index_path,
            None if location.autoindex => {
                return directory_listing(&fs_path, &request.path, location)
            }
            None => return Response::error(404, Some(location)),
        }
    }

    if !fs_path.is_file() {
        return Response::error(404, Some(location));
    }

    let size = fs_path.metadata().map(|m| m.len()).unwrap_or(0);
    let content = match fs::read(&fs_path) {
        Ok(content) => content,
        Err(e) => {
            warn!("failed to read {:?}: {}", fs_path, e);
            return Response::error(404, Some(location));
        }
    };
    let mime = mime_guess::from_path(&fs_path).first_or_octet_stream();

    if size > LARGE_FILE_THRESHOLD {
        let mut response = Response::new(200);
        response.set_header("Content-Type", mime.essence_str());
        response.set_header("Transfer-Encoding", "chunked");
        response.body = chunk_encode(&content);
        response
    } else {
        Response::with_body(200, mime.essence_str(), content)
    }
}

fn directory_listing(fs_path: &Path, url_path: &str, location: &Location) -> Response {
    let reader = match fs::read_dir(fs_path) {
        Ok(reader) => reader,
        Err(_) => return Response::error(500, Some(location)),
    };
    let mut entries: Vec<String> = reader
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();

    let mut html = format!(
        "<html><head><title>Index of {0}</title></head><body><h1>Index of {0}</h1><ul>",
        url_path
    );
    for name in entries {
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>",
            url_encode(&name),
            name
        ));
    }
    html.push_str("</ul></body></html>");
    Response::with_body(200, "text/html", html.into_bytes())
}

fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn handle_post(request: &Request, location: &Location) -> Response {
    if request.body.is_empty() {
        return Response::error(400, Some(location));
    }
    let upload_dir = match &location.upload_path {
        Some(dir) => PathBuf::from(dir),
        None => return Response::error(403, Some(location)),
    };
    if !upload_dir.is_dir() {
        if let Err(e) = fs::create_dir_all(&upload_dir) {
            warn!("cannot create upload dir {:?}: {}", upload_dir, e);
            return Response::error(500, Some(location));
        }
    }

    let content_type = request.header("Content-Type").unwrap_or("");
    let form = match parse_form(content_type, &request.body) {
        Ok(form) => form,
        Err(e) => return Response::error(e.status, Some(location)),
    };

    // Multipart bodies store each file part; anything else stores the raw
    // body as a single upload.
    let mut saved = Vec::new();
    match form {
        Some(form) if !form.files.is_empty() => {
            for part in &form.files {
                match save_upload(&upload_dir, Some(&part.filename), &part.data) {
                    Ok(name) => saved.push(name),
                    Err(response) => return response,
                }
            }
        }
        _ => match save_upload(&upload_dir, None, &request.body) {
            Ok(name) => saved.push(name),
            Err(response) => return response,
        },
    }

    info!("stored {} upload(s) under {:?}", saved.len(), upload_dir);
    let mut body = String::from("POST request handled successfully");
    for name in &saved {
        body.push_str("\nFile ID: ");
        body.push_str(name);
    }
    Response::with_body(200, "text/plain", body.into_bytes())
}

fn save_upload(dir: &Path, filename: Option<&str>, data: &[u8]) -> Result<String, Response> {
    let name = unique_name(filename);
    let path = dir.join(&name);
    match fs::write(&path, data) {
        Ok(()) => Ok(name),
        Err(e) => {
            warn!("failed to write upload {:?}: {}", path, e);
            Err(Response::error(500, None))
        }
    }
}

/// Unique upload name from a timestamp and a monotonic counter, keeping the
/// client filename's extension when one was supplied.
fn unique_name(filename: Option<&str>) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let ext = filename
        .and_then(|f| Path::new(f).extension())
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    format!("upload_{}_{}{}", secs, seq, ext)
}

fn handle_delete(request: &Request, location: &Location) -> Response {
    let upload_dir = match &location.upload_path {
        Some(dir) => PathBuf::from(dir),
        None => return Response::error(403, Some(location)),
    };
    // Deletion targets live under the upload path; the location prefix is
    // stripped from the URI first.
    let relative = request
        .path
        .strip_prefix(location.path.trim_end_matches('/'))
        .unwrap_or(&request.path);
    let fs_path = upload_dir.join(relative.trim_start_matches('/'));

    if !fs_path.is_file() {
        return Response::error(404, Some(location));
    }
    match fs::remove_file(&fs_path) {
        Ok(()) => {
            info!("deleted {:?}", fs_path);
            Response::with_body(
                200,
                "text/plain",
                b"DELETE request handled successfully".to_vec(),
            )
        }
        Err(e) => {
            warn!("failed to delete {:?}: {}", fs_path, e);
            Response::error(500, Some(location))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "webserv_test_{}_{}_{}",
            tag,
            std::process::id(),
            UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn location(root: &Path, upload: Option<&Path>) -> Location {
        Location {
            path: "/".into(),
            root: root.to_string_lossy().into_owned(),
            index: vec!["index.html".into()],
            allowed_methods: vec!["GET".into(), "POST".into(), "DELETE".into()],
            autoindex: false,
            upload_path: upload.map(|p| p.to_string_lossy().into_owned()),
            max_body_size: 1024,
            cgi: HashMap::new(),
            error_pages: HashMap::new(),
            redirect: None,
        }
    }

    fn get(path: &str) -> Request {
        Request {
            method: "GET".into(),
            path: path.into(),
            query: String::new(),
            version: "HTTP/1.1".into(),
            headers: HashMap::new(),
            body: Vec::new(),
            body_policy: crate::http::request::BodyPolicy::None,
        }
    }

    #[test]
    fn serves_file_with_mime_and_idempotently() {
        let root = temp_dir("get");
        fs::write(root.join("page.html"), "<h1>hi</h1>").unwrap();
        let loc = location(&root, None);

        let first = handle(&get("/page.html"), &loc);
        let second = handle(&get("/page.html"), &loc);
        assert_eq!(first.status, 200);
        assert_eq!(first.header("Content-Type"), Some("text/html"));
        assert_eq!(first.to_bytes(), second.to_bytes());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_file_is_404() {
        let root = temp_dir("missing");
        let loc = location(&root, None);
        assert_eq!(handle(&get("/nope.txt"), &loc).status, 404);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn directory_serves_index_then_autoindex() {
        let root = temp_dir("dir");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/a name.txt"), "x").unwrap();
        let mut loc = location(&root, None);

        // No index file, autoindex off: 404.
        assert_eq!(handle(&get("/sub"), &loc).status, 404);

        loc.autoindex = true;
        let listing = handle(&get("/sub"), &loc);
        assert_eq!(listing.status, 200);
        let html = String::from_utf8_lossy(&listing.body).into_owned();
        assert!(html.contains("Index of /sub"));
        assert!(html.contains("a%20name.txt"));

        fs::write(root.join("sub/index.html"), "indexed").unwrap();
        let indexed = handle(&get("/sub"), &loc);
        assert_eq!(indexed.body, b"indexed");
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn large_file_streams_chunked() {
        let root = temp_dir("large");
        let data = vec![b'x'; LARGE_FILE_THRESHOLD as usize + 1];
        fs::write(root.join("big.bin"), &data).unwrap();
        let loc = location(&root, None);

        let response = handle(&get("/big.bin"), &loc);
        assert_eq!(response.header("Transfer-Encoding"), Some("chunked"));
        assert!(response.header("Content-Length").is_none());
        assert!(response.body.ends_with(b"0\r\n\r\n"));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn post_without_upload_path_is_403() {
        let root = temp_dir("post403");
        let loc = location(&root, None);
        let mut request = get("/");
        request.method = "POST".into();
        request.body = b"data".to_vec();
        assert_eq!(handle(&request, &loc).status, 403);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn post_stores_raw_body_and_delete_removes_it() {
        let root = temp_dir("roundtrip");
        let uploads = root.join("uploads");
        let loc = location(&root, Some(&uploads));

        let mut post = get("/");
        post.method = "POST".into();
        post.body = b"file contents".to_vec();
        let response = handle(&post, &loc);
        assert_eq!(response.status, 200);
        let body = String::from_utf8_lossy(&response.body).into_owned();
        let name = body.split("File ID: ").nth(1).unwrap().trim().to_string();
        assert_eq!(fs::read(uploads.join(&name)).unwrap(), b"file contents");

        let mut delete = get(&format!("/{}", name));
        delete.method = "DELETE".into();
        assert_eq!(handle(&delete, &loc).status, 200);
        assert!(!uploads.join(&name).exists());

        // Deleting it again is a 404.
        assert_eq!(handle(&delete, &loc).status, 404);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn traversal_is_rejected() {
        let root = temp_dir("traversal");
        let loc = location(&root, Some(&root));
        let mut request = get("/../secret");
        request.method = "DELETE".into();
        assert_eq!(handle(&request, &loc).status, 400);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn multipart_post_stores_each_file_part() {
        let root = temp_dir("multipart");
        let uploads = root.join("up");
        let loc = location(&root, Some(&uploads));

        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"f\"; filename=\"notes.txt\"\r\n\r\n\
            part one\r\n\
            --B--\r\n";
        let mut post = get("/");
        post.method = "POST".into();
        post.headers.insert(
            "Content-Type".into(),
            "multipart/form-data; boundary=B".into(),
        );
        post.body = body.to_vec();

        let response = handle(&post, &loc);
        assert_eq!(response.status, 200);
        let stored: Vec<_> = fs::read_dir(&uploads).unwrap().collect();
        assert_eq!(stored.len(), 1);
        let path = stored[0].as_ref().unwrap().path();
        assert_eq!(path.extension().unwrap(), "txt");
        assert_eq!(fs::read(path).unwrap(), b"part one");
        fs::remove_dir_all(&root).unwrap();
    }
}
