/// This struct is used to configure optional behaviour within the ESI processor.
///
/// ## Usage Example
/// ```rust,no_run
/// let config = esi_resolver::Configuration::default()
///     .with_namespace("app")
///     .with_enabled(false);
/// ```
#[allow(clippy::return_self_not_must_use)]
#[derive(Clone, Debug)]
pub struct Configuration {
    /// The namespace that identifies ESI instructions, e.g. `esi` for `<esi:include>`.
    pub namespace: String,
    /// Process every eligible response. When disabled, only responses that opt in
    /// through the control header are processed.
    pub enabled: bool,
    /// Response header inspected for the opt-in and opt-out tokens.
    pub control_header: String,
    pub opt_in_token: String,
    pub opt_out_token: String,
    /// Header marking a request as an ESI fragment request.
    pub fragment_header: String,
    /// Header carrying the loop-depth token on fragment requests.
    pub loop_header: String,
    pub loop_token: String,
    /// Host-config variable naming a host that fragments are fetched from directly.
    pub fragment_host_variable: String,
    /// Host-config variable holding extra fragment headers as `key=value,key=value`.
    pub fragment_headers_variable: String,
    /// For working with non-HTML ESI templates, e.g. JSON files, this option allows you to disable
    /// the unescaping of URLs
    pub is_escaped_content: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            namespace: String::from("esi"),
            enabled: true,
            control_header: String::from("edge-control"),
            opt_in_token: String::from("dca=esi"),
            opt_out_token: String::from("dca=noop"),
            fragment_header: String::from("x-esi-fragment"),
            loop_header: String::from("x-esi-loop"),
            loop_token: String::from("1"),
            fragment_host_variable: String::from("builtin.ESI_FRAGMENT_HOST"),
            fragment_headers_variable: String::from("builtin.ESI_FRAGMENT_HEADERS"),
            is_escaped_content: true,
        }
    }
}

impl Configuration {
    /// Sets an alternative ESI namespace, which is used to identify ESI instructions.
    ///
    /// For example, setting this to `test` would cause the processor to only match tags like
    /// `<test:include>`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
    /// Turns unconditional processing on or off. The control header can still opt in.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    /// Sets the response header and the tokens that opt a response in to or out of processing.
    pub fn with_control_header(
        mut self,
        header: impl Into<String>,
        opt_in_token: impl Into<String>,
        opt_out_token: impl Into<String>,
    ) -> Self {
        self.control_header = header.into();
        self.opt_in_token = opt_in_token.into();
        self.opt_out_token = opt_out_token.into();
        self
    }
    /// Sets the names of the host-config variables consulted when building fragment requests.
    pub fn with_fragment_variables(
        mut self,
        host_variable: impl Into<String>,
        headers_variable: impl Into<String>,
    ) -> Self {
        self.fragment_host_variable = host_variable.into();
        self.fragment_headers_variable = headers_variable.into();
        self
    }
    /// Sets the token sent in the loop-depth header of every fragment request.
    pub fn with_loop_token(mut self, token: impl Into<String>) -> Self {
        self.loop_token = token.into();
        self
    }
    /// For working with non-HTML ESI templates, eg JSON files, allows to disable URLs unescaping
    pub fn with_escaped(mut self, is_escaped: impl Into<bool>) -> Self {
        self.is_escaped_content = is_escaped.into();
        self
    }

    /// The byte sequence whose presence in a body marks it as an ESI document.
    pub(crate) fn tag_marker(&self) -> String {
        format!("<{}:", self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.namespace, "esi");
        assert!(config.enabled);
        assert_eq!(config.tag_marker(), "<esi:");
        assert_eq!(config.loop_token, "1");
    }

    #[test]
    fn test_builder_overrides() {
        let config = Configuration::default()
            .with_namespace("app")
            .with_enabled(false)
            .with_control_header("surrogate-control", "content=\"ESI/1.0\"", "no-esi")
            .with_escaped(false);
        assert_eq!(config.tag_marker(), "<app:");
        assert!(!config.enabled);
        assert_eq!(config.control_header, "surrogate-control");
        assert_eq!(config.opt_out_token, "no-esi");
        assert!(!config.is_escaped_content);
    }
}
