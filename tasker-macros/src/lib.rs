use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::quote;
use syn::{parse_macro_input, punctuated::Punctuated, FnArg, Ident, ItemFn, Lit, Meta, Token};

const OPERATION: &str = "operation";

fn to_pascal_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Turns `async fn name(task: RunningTask) -> anyhow::Result<Value>` into a
/// `NameRunner` unit struct implementing `tasker::Runner`.
///
/// ```ignore
/// #[runner(operation = "sum")]
/// async fn sum(task: RunningTask) -> anyhow::Result<Value> { ... }
///
/// tasker.assign_runner(SumRunner::OPERATION, SumRunner)?;
/// ```
///
/// The operation defaults to the function name.
#[proc_macro_attribute]
#[proc_macro_error]
pub fn runner(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse runner attributes: {}", e));

    let mut operation: Option<String> = None;
    for meta in &attr_args {
        match meta {
            Meta::NameValue(nv) if nv.path.is_ident(OPERATION) => {
                if let syn::Expr::Lit(expr_lit) = &nv.value {
                    if let Lit::Str(lit) = &expr_lit.lit {
                        operation = Some(lit.value());
                    } else {
                        abort!(expr_lit, "Expected a string literal for operation");
                    }
                } else {
                    abort!(nv.value, "Expected a string literal for operation");
                }
            }
            other => abort!(other, "Only 'operation = \"...\"' is supported in #[runner]"),
        }
    }

    let input = parse_macro_input!(item as ItemFn);
    let fn_name = &input.sig.ident;
    let fn_vis = &input.vis;

    if input.sig.asyncness.is_none() {
        abort!(input.sig.fn_token, "#[runner] functions must be async");
    }
    if input.sig.inputs.len() != 1 {
        abort!(
            input.sig.inputs,
            "#[runner] functions take exactly one RunningTask argument"
        );
    }
    if let Some(FnArg::Receiver(receiver)) = input.sig.inputs.first() {
        abort!(receiver, "#[runner] cannot be applied to methods");
    }

    let fn_name_str = fn_name.to_string();
    let operation = operation.unwrap_or_else(|| fn_name_str.clone());
    if operation.is_empty() {
        abort!(fn_name, "operation must not be empty");
    }
    let struct_name = Ident::new(
        &format!("{}Runner", to_pascal_case(&fn_name_str)),
        fn_name.span(),
    );

    let expanded = quote! {
        #input

        #[derive(Debug, Clone, Copy, Default)]
        #fn_vis struct #struct_name;

        impl #struct_name {
            /// Operation name this runner is meant to be assigned to.
            pub const OPERATION: &'static str = #operation;
        }

        #[::tasker::async_trait]
        impl ::tasker::Runner for #struct_name {
            async fn run(
                &self,
                task: ::tasker::RunningTask,
            ) -> ::tasker::anyhow::Result<::tasker::serde_json::Value> {
                #fn_name(task).await
            }
        }
    };

    TokenStream::from(expanded)
}
