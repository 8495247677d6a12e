//! Passphrase login page

use axum::response::{Html, IntoResponse, Response};

const LOGIN_ERROR: &str =
    r#"<div class="error" role="alert">Invalid passphrase</div>"#;

/// Render the login form, optionally with the invalid passphrase notice
pub fn login_page(invalid: bool) -> Response {
    let error = if invalid { LOGIN_ERROR } else { "" };
    Html(LOGIN_HTML.replace("{{error}}", error)).into_response()
}

const LOGIN_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Flint - Login</title>
    <style>
        body { font-family: system-ui, sans-serif; margin: 50px; background: #f5f5f5; }
        .login { background: #fff; padding: 30px; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); max-width: 400px; margin: 0 auto; }
        .error { color: #c62828; margin-bottom: 10px; }
        input[type="password"] { width: 100%; box-sizing: border-box; padding: 10px; margin: 10px 0; border: 1px solid #ddd; border-radius: 4px; }
        button { background: #007bff; color: #fff; padding: 10px 20px; border: none; border-radius: 4px; cursor: pointer; width: 100%; }
        button:hover { background: #0056b3; }
    </style>
</head>
<body>
    <div class="login">
        <h2>Flint Web UI</h2>
        {{error}}
        <form method="POST" action="/login">
            <input type="password" name="passphrase" placeholder="Enter passphrase" autofocus required>
            <button type="submit">Login</button>
        </form>
    </div>
</body>
</html>
"#;
