use reqwest::Method;

/// One REST call: method, a path template with positional `{}` slots, and
/// the values that fill them.
#[derive(Debug, Clone)]
pub struct Route {
    method: Method,
    template: &'static str,
    params: Vec<String>,
    query: Vec<(String, String)>,
}

impl Route {
    pub fn new(method: Method, template: &'static str) -> Self {
        Self {
            method,
            template,
            params: Vec::new(),
            query: Vec::new(),
        }
    }

    pub fn get(template: &'static str) -> Self {
        Self::new(Method::GET, template)
    }

    pub fn post(template: &'static str) -> Self {
        Self::new(Method::POST, template)
    }

    pub fn patch(template: &'static str) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub fn delete(template: &'static str) -> Self {
        Self::new(Method::DELETE, template)
    }

    pub fn param(mut self, value: impl ToString) -> Self {
        self.params.push(value.to_string());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// Identifies the request family before the server has named a bucket.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }

    /// Substitutes the positional params. Surplus slots stay empty.
    pub fn path(&self) -> String {
        let mut out = String::with_capacity(self.template.len() + 20 * self.params.len());
        let mut params = self.params.iter();
        let mut rest = self.template;
        while let Some(idx) = rest.find("{}") {
            out.push_str(&rest[..idx]);
            if let Some(value) = params.next() {
                out.push_str(value);
            }
            rest = &rest[idx + 2..];
        }
        out.push_str(rest);
        out
    }
}
