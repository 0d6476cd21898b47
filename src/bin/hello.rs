use synapse_bus::prelude::*;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct HelloPlugin;

#[async_trait]
impl Plugin for HelloPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("hello", "1.0.0").with_dependency("greeter")
    }

    async fn register(&self, ctx: &Context) -> Result<()> {
        let greeter = ctx.get("greeter");
        ctx.on(
            "launch",
            handler(move |_| {
                let greeting = greeter.request("greet", args!["World"]);
                async move {
                    match greeting.await? {
                        Some(text) => println!("{}", text.as_str().unwrap_or_default()),
                        None => println!("nobody answered"),
                    }
                    Ok(None)
                }
            }),
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let greeter = plugin_fn!("greeter", "1.0.0", |ctx: Context| async move {
        ctx.get("greeter").respond(
            "greet",
            Handler::from_fn(|args| {
                let name = args.first().and_then(|v| v.as_str()).unwrap_or("stranger");
                Ok(Some(format!("Hello, {}!", name).into()))
            }),
        );
        Ok::<_, BusError>(())
    });

    let app = Application::build()
        .with_config(AppConfig::new("hello"))
        .add_provider(EnvProvider::new().with_prefix("HELLO_"))
        .add_plugin(HelloPlugin)
        .add_plugin(greeter)
        .build();

    app.start(Default::default()).await?;
    app.stop().await
}
